use companion_bridge::protocol::{
    BufferData, ButtonTarget, FillImage, OutboundCommand, IMAGE_BUFFER_LEN,
};
use rand::{thread_rng, Rng};
use serde_json::json;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tungstenite::protocol::Message;
use tungstenite::WebSocket;

const DEFAULT_ADDR: &str = "127.0.0.1:28492";
const DEFAULT_PUSH_MS: u64 = 1000;
const DYNAMIC_KEYS: u32 = 32;

fn parse_arg_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn solid(rgb: [u8; 3]) -> Vec<u8> {
    rgb.iter().copied().cycle().take(IMAGE_BUFFER_LEN).collect()
}

fn random_rgb() -> [u8; 3] {
    let mut rng = thread_rng();
    [rng.gen(), rng.gen(), rng.gen()]
}

fn fill_frame(key_index: u32, page: Option<u32>, bank: Option<u32>, rgb: [u8; 3]) -> String {
    let fill = FillImage {
        key_index,
        page,
        bank,
        data: BufferData::from_rgb(solid(rgb)),
    };
    json!({ "command": "fillImage", "arguments": fill }).to_string()
}

fn send_text(ws: &mut WebSocket<TcpStream>, text: String) -> bool {
    ws.send(Message::Text(text.into())).is_ok()
}

/// Answers one client command. Returns false when the socket is gone.
fn handle_command(ws: &mut WebSocket<TcpStream>, cmd: OutboundCommand) -> bool {
    match cmd.command.as_str() {
        "version" => {
            info!(arguments = %cmd.arguments, "client version");
            send_text(
                ws,
                json!({ "response": "version", "arguments": { "serverVersion": 2 } }).to_string(),
            )
        }
        "new_device" => {
            info!(device_id = %cmd.arguments, "client registered");
            send_text(
                ws,
                json!({ "response": "new_device", "arguments": { "deviceId": cmd.arguments } })
                    .to_string(),
            )
        }
        "request_button" => {
            let Ok(ButtonTarget::Paged { page, bank }) =
                serde_json::from_value::<ButtonTarget>(cmd.arguments)
            else {
                warn!("request_button without page/bank");
                return true;
            };
            info!(page, bank, "client requested button");
            send_text(ws, fill_frame(bank, Some(page), Some(bank), random_rgb()))
        }
        "keydown" | "keyup" => {
            info!(command = %cmd.command, arguments = %cmd.arguments, "button event");
            match serde_json::from_value::<ButtonTarget>(cmd.arguments) {
                Ok(ButtonTarget::Dynamic { key_index }) if cmd.command == "keydown" => {
                    send_text(ws, fill_frame(key_index, None, None, random_rgb()))
                }
                Ok(ButtonTarget::Paged { page, bank }) if cmd.command == "keydown" => {
                    send_text(ws, fill_frame(bank, Some(page), Some(bank), random_rgb()))
                }
                _ => true,
            }
        }
        other => {
            debug!(command = other, "unhandled command");
            true
        }
    }
}

fn serve(listener: &TcpListener, push_every: Duration, deadline: Option<Instant>) {
    let mut active: Option<WebSocket<TcpStream>> = None;
    let mut last_push = Instant::now();
    let mut next_key = 0u32;

    while deadline.map_or(true, |d| Instant::now() < d) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_nodelay(true);
                let _ = stream.set_read_timeout(Some(Duration::from_millis(30)));
                match tungstenite::accept(stream) {
                    Ok(ws) => {
                        // Single-client policy: a new client replaces the old one.
                        if let Some(mut prev) = active.take() {
                            let _ = prev.close(None);
                        }
                        info!(%addr, "client connected");
                        active = Some(ws);
                    }
                    Err(e) => warn!(error = %e, "ws handshake failed"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }

        let Some(ws) = active.as_mut() else {
            thread::sleep(Duration::from_millis(25));
            continue;
        };

        let alive = match ws.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<OutboundCommand>(text.as_str()) {
                Ok(cmd) => handle_command(ws, cmd),
                Err(e) => {
                    warn!(error = %e, "invalid client json");
                    true
                }
            },
            Ok(Message::Close(_)) => false,
            Ok(_) => true,
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                true
            }
            Err(_) => false,
        };

        let alive = if alive && last_push.elapsed() >= push_every {
            last_push = Instant::now();
            let key = next_key;
            next_key = (next_key + 1) % DYNAMIC_KEYS;
            send_text(ws, fill_frame(key, None, None, random_rgb()))
        } else {
            alive
        };

        if !alive {
            info!("client disconnected");
            active = None;
        }
    }

    if let Some(mut ws) = active {
        let _ = ws.close(None);
        let _ = ws.flush();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let addr = parse_arg_value(&args, "--addr")
        .or_else(|| std::env::var("COMPANION_MOCK_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let push_every = parse_arg_value(&args, "--push-ms")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_PUSH_MS));
    let deadline = parse_arg_value(&args, "--run-for-ms")
        .and_then(|s| s.parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let listener = match TcpListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("bind failed on {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        eprintln!("failed to make listener non-blocking: {e}");
        std::process::exit(1);
    }

    let local = listener.local_addr().map(|a| a.to_string()).unwrap_or(addr);
    println!("mock_companion listening on ws://{local}");

    serve(&listener, push_every, deadline);
}
