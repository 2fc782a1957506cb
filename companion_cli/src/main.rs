use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use companion_bridge::protocol::ButtonAddress;
use companion_bridge::{
    Bitmap, BridgeConfig, ButtonImage, CompanionPlugin, ImageNotifier, SessionStatus, StatusLevel,
};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "companion_cli")]
struct Args {
    /// Controller websocket URL; falls back to COMPANION_WS_URL.
    #[arg(long, global = true)]
    url: Option<String>,

    #[arg(long, global = true)]
    device_id: Option<String>,

    #[arg(long, global = true)]
    backoff_ms: Option<u64>,

    /// How long to wait for the controller before giving up.
    #[arg(long, global = true, default_value_t = 10_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log status changes and pushed images.
    Watch {
        #[arg(long, default_value_t = 30_000)]
        listen_ms: u64,
    },
    /// Tap a button once connected.
    Press { address: String },
    /// Ask for a button image and wait for it.
    Request { address: String },
}

/// Forwards repaint notifications to the main thread.
struct ChannelNotifier(Sender<String>);

impl ImageNotifier for ChannelNotifier {
    fn command_image_changed(&self, action: &str) {
        let _ = self.0.send(action.to_string());
    }
}

fn config_from(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::from_env();
    if let Some(url) = args.url.as_deref() {
        config.url = url.trim().to_string();
    }
    if let Some(id) = args.device_id.as_deref() {
        config.device_id = id.trim().to_string();
    }
    if let Some(ms) = args.backoff_ms {
        config.backoff = Duration::from_millis(ms);
    }
    config
        .validate()
        .with_context(|| format!("invalid controller url {}", config.url))?;
    Ok(config)
}

fn parse_address(raw: &str) -> anyhow::Result<ButtonAddress> {
    let address: ButtonAddress = raw
        .parse()
        .map_err(|e| anyhow!("bad button address {raw:?}: {e}"))?;
    if !address.in_grid() {
        bail!("button address {address} is outside pages 0..100 / banks 0..32");
    }
    Ok(address)
}

fn print_status(status: &SessionStatus) {
    match status.level() {
        StatusLevel::Normal => eprintln!("status: {status}"),
        StatusLevel::Warning => eprintln!("warning: {status}"),
        StatusLevel::Error => eprintln!("error: {status}"),
    }
}

fn wait_connected(plugin: &CompanionPlugin, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("controller not reachable within {timeout:?}"))?;
        match plugin.statuses().recv_timeout(left) {
            Ok(status) => {
                print_status(&status);
                if status == SessionStatus::Connected {
                    return Ok(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                bail!("controller not reachable within {timeout:?}")
            }
            Err(RecvTimeoutError::Disconnected) => bail!("session ended"),
        }
    }
}

fn describe(bitmap: &Bitmap) -> String {
    let mut sum = [0u64; 3];
    for px in bitmap.as_rgb().chunks_exact(3) {
        for (acc, c) in sum.iter_mut().zip(px) {
            *acc += u64::from(*c);
        }
    }
    let n = (bitmap.width() * bitmap.height()) as u64;
    format!(
        "{}x{} mean rgb({}, {}, {})",
        bitmap.width(),
        bitmap.height(),
        sum[0] / n,
        sum[1] / n,
        sum[2] / n
    )
}

fn watch(plugin: &CompanionPlugin, listen: Duration) -> anyhow::Result<()> {
    let _subscription = plugin.session().fill_images().subscribe(|event| {
        info!(
            mode = ?event.mode,
            key_index = event.key_index,
            page = ?event.page,
            bank = ?event.bank,
            "fill image"
        );
    });
    plugin.load()?;

    let deadline = Instant::now() + listen;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match plugin.statuses().recv_timeout(left) {
            Ok(status) => print_status(&status),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn press(plugin: &CompanionPlugin, address: ButtonAddress, timeout: Duration) -> anyhow::Result<()> {
    let (tx, _rx) = unbounded();
    let grid = plugin.button_grid(Arc::new(ChannelNotifier(tx)));
    plugin.load()?;
    wait_connected(plugin, timeout)?;

    grid.run_command(&address.to_string());
    eprintln!("pressed {address}");
    Ok(())
}

fn request(
    plugin: &CompanionPlugin,
    address: ButtonAddress,
    timeout: Duration,
) -> anyhow::Result<()> {
    let (tx, rx) = unbounded();
    let grid = plugin.button_grid(Arc::new(ChannelNotifier(tx)));
    plugin.load()?;
    wait_connected(plugin, timeout)?;

    let action = address.to_string();
    let deadline = Instant::now() + timeout;
    loop {
        match grid.image(&action) {
            Some(ButtonImage::Bitmap(bitmap)) => {
                println!("{action}: {}", describe(&bitmap));
                return Ok(());
            }
            Some(ButtonImage::Missing) | Some(ButtonImage::Disconnected) => {}
            None => bail!("{action} is not a grid button"),
        }

        let left = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("no image for {action} within {timeout:?}"))?;
        // Any repaint may be ours; re-check the cache either way.
        match rx.recv_timeout(left) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("notifier closed"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = config_from(&args)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let plugin = CompanionPlugin::new(config);

    let result = match &args.command {
        Command::Watch { listen_ms } => watch(&plugin, Duration::from_millis(*listen_ms)),
        Command::Press { address } => press(&plugin, parse_address(address)?, timeout),
        Command::Request { address } => request(&plugin, parse_address(address)?, timeout),
    };

    plugin.unload();
    result
}
