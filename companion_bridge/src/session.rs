use crate::config::BridgeConfig;
use crate::dispatcher::dispatch_text;
use crate::error::BridgeError;
use crate::events::FillImageBus;
use crate::net::{self, CloseReason};
use companion_protocol::{encode, OutboundCommand, PROTOCOL_VERSION};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

pub const STATUS_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Operator-facing connection status, emitted on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    NotConnected,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Normal,
    Warning,
    Error,
}

impl SessionStatus {
    pub fn level(&self) -> StatusLevel {
        match self {
            SessionStatus::Connected => StatusLevel::Normal,
            SessionStatus::NotConnected => StatusLevel::Warning,
            SessionStatus::Error(_) => StatusLevel::Error,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connected => f.write_str("Connected"),
            SessionStatus::NotConnected => f.write_str(
                "Could not connect to companion, is it running on this machine, and \
                 'Use Elgato Plugin for StreamDeck access' is enabled?",
            ),
            SessionStatus::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}

/// The outbound surface input handlers talk to.
pub trait CommandSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Fire-and-forget; dropped while disconnected.
    fn send_command(&self, cmd: OutboundCommand);

    /// Remembered for the lifetime of the session and replayed after every
    /// handshake; also sent right away when connected.
    fn on_connect_command(&self, cmd: OutboundCommand);
}

struct Link {
    id: u64,
    tx: Sender<String>,
}

struct Shared {
    config: BridgeConfig,
    state: Mutex<SessionState>,
    // Lock order: connect_commands, then link, then state.
    connect_commands: Mutex<Vec<OutboundCommand>>,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    status_tx: Sender<SessionStatus>,
    fill_images: FillImageBus,
    stop_rx: Receiver<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// No transition leaves `ShuttingDown`.
    fn transition(&self, to: SessionState) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::ShuttingDown {
            return false;
        }
        *state = to;
        true
    }

    fn emit(&self, status: SessionStatus) {
        debug!(%status, "session status");
        let _ = self.status_tx.try_send(status);
    }

    fn drop_link(&self) {
        lock(&self.link).take();
    }

    /// Queues the handshake and every connect-command on a fresh outbound
    /// channel before the link becomes visible, so nothing a caller sends
    /// can overtake them.
    fn install_link(&self) -> Option<(u64, Receiver<String>)> {
        let (tx, rx) = unbounded();

        let commands = lock(&self.connect_commands);
        let handshake = [
            OutboundCommand::version(PROTOCOL_VERSION),
            OutboundCommand::new_device(&self.config.device_id),
        ];
        for cmd in handshake.iter().chain(commands.iter()) {
            match encode(cmd) {
                Ok(text) => {
                    let _ = tx.send(text);
                }
                Err(e) => warn!(command = %cmd.command, error = %e, "failed to encode command"),
            }
        }

        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let mut link = lock(&self.link);
        if !self.transition(SessionState::Connected) {
            return None;
        }
        *link = Some(Link { id, tx });
        debug!(link_id = id, replayed = commands.len(), "link installed");
        Some((id, rx))
    }

    /// Detaches link `id` and reports `status`, unless the session is
    /// shutting down.
    fn release_link(&self, id: u64, status: Option<SessionStatus>) {
        {
            let mut link = lock(&self.link);
            if link.as_ref().is_some_and(|l| l.id == id) {
                *link = None;
            }
        }
        if !self.transition(SessionState::Disconnected) {
            return;
        }
        if let Some(status) = status {
            info!(link_id = id, %status, "connection to controller lost");
            self.emit(status);
        }
    }

    fn send_text(&self, text: String) -> bool {
        match lock(&self.link).as_ref() {
            Some(link) => link.tx.send(text).is_ok(),
            None => false,
        }
    }

    fn connect_once(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>, BridgeError> {
        if !self.transition(SessionState::Connecting) {
            return Ok(None);
        }
        debug!(url = %self.config.url, "connecting to controller");
        let ws = net::open(&self.config)?;

        let Some((link_id, outbound_rx)) = self.install_link() else {
            return Ok(None);
        };
        info!(link_id, url = %self.config.url, "connected to controller");
        self.emit(SessionStatus::Connected);

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("companion-io".to_string())
            .spawn(move || {
                let bus = shared.fill_images.clone();
                // Bus handlers are host code; a panic there must still free the link.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    net::run_connection(ws, outbound_rx, |text| {
                        dispatch_text(text, &bus);
                    })
                }));
                let status = match outcome {
                    Ok(CloseReason::Remote) => Some(SessionStatus::NotConnected),
                    Ok(CloseReason::Local) => None,
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        error!(link_id, %msg, "connection thread panicked");
                        Some(SessionStatus::Error(msg))
                    }
                };
                shared.release_link(link_id, status);
            });

        match spawned {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                self.release_link(link_id, None);
                Err(BridgeError::Spawn(e))
            }
        }
    }
}

fn run_reconnect_loop(shared: Arc<Shared>) {
    let mut io_thread: Option<JoinHandle<()>> = None;

    loop {
        if shared.state() == SessionState::ShuttingDown {
            break;
        }

        if shared.state() != SessionState::Connected {
            if let Some(stale) = io_thread.take() {
                let _ = stale.join();
            }

            match panic::catch_unwind(AssertUnwindSafe(|| shared.connect_once())) {
                Ok(Ok(Some(handle))) => io_thread = Some(handle),
                Ok(Ok(None)) => {}
                Ok(Err(e)) if e.is_unreachable() => {
                    shared.transition(SessionState::Disconnected);
                    debug!(error = %e, "controller unreachable");
                    shared.emit(SessionStatus::NotConnected);
                }
                Ok(Err(e)) => {
                    shared.transition(SessionState::Disconnected);
                    warn!(error = %e, "connection attempt failed");
                    shared.emit(SessionStatus::Error(e.to_string()));
                }
                Err(payload) => {
                    shared.transition(SessionState::Disconnected);
                    let msg = panic_message(payload.as_ref());
                    error!(%msg, "reconnect attempt panicked");
                    shared.emit(SessionStatus::Error(msg));
                }
            }
        }

        match shared.stop_rx.recv_timeout(shared.config.backoff) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.drop_link();
    if let Some(handle) = io_thread.take() {
        let _ = handle.join();
    }
    debug!("reconnect loop stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Self-healing connection to the controller.
///
/// One background thread owns connection attempts; each live connection gets
/// its own I/O thread that is the only writer to the socket. Callers on any
/// thread enqueue through [`CommandSink`] without blocking.
pub struct Session {
    shared: Arc<Shared>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(config: BridgeConfig) -> (Self, Receiver<SessionStatus>) {
        let (status_tx, status_rx) = bounded(STATUS_CAP);
        let (stop_tx, stop_rx) = bounded(1);

        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(SessionState::Disconnected),
            connect_commands: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            next_link_id: AtomicU64::new(1),
            status_tx,
            fill_images: FillImageBus::new(),
            stop_rx,
        });

        let session = Self {
            shared,
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(None),
        };
        (session, status_rx)
    }

    /// Starts the reconnect loop. Calling it again, or after `stop`, does nothing.
    pub fn start(&self) -> Result<(), BridgeError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() || self.shared.state() == SessionState::ShuttingDown {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("companion-reconnect".to_string())
            .spawn(move || run_reconnect_loop(shared))
            .map_err(BridgeError::Spawn)?;
        *worker = Some(handle);
        Ok(())
    }

    /// Cancels the reconnect loop and closes the connection. Later sends are no-ops.
    pub fn stop(&self) {
        *lock(&self.shared.state) = SessionState::ShuttingDown;
        self.shared.drop_link();
        lock(&self.stop_tx).take();

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Inbound fill-image events; subscribe caches here.
    pub fn fill_images(&self) -> &FillImageBus {
        &self.shared.fill_images
    }

    pub fn connect_commands(&self) -> Vec<OutboundCommand> {
        lock(&self.shared.connect_commands).clone()
    }
}

impl CommandSink for Session {
    fn is_connected(&self) -> bool {
        self.shared.state() == SessionState::Connected
    }

    fn send_command(&self, cmd: OutboundCommand) {
        let text = match encode(&cmd) {
            Ok(text) => text,
            Err(e) => {
                warn!(command = %cmd.command, error = %e, "failed to encode command");
                return;
            }
        };
        if !self.shared.send_text(text) {
            trace!(command = %cmd.command, "not connected, dropping command");
        }
    }

    fn on_connect_command(&self, cmd: OutboundCommand) {
        let mut commands = lock(&self.shared.connect_commands);
        let text = encode(&cmd);
        commands.push(cmd);
        if let Ok(text) = text {
            self.shared.send_text(text);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
