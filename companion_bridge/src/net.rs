use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crossbeam_channel::{Receiver, TryRecvError};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, trace, warn};
use tungstenite::handshake::HandshakeError;
use tungstenite::protocol::Message;
use tungstenite::WebSocket;

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) type Socket = WebSocket<TcpStream>;

/// Why a connection thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The controller closed the socket or the stream failed.
    Remote,
    /// The session dropped its side of the outbound queue.
    Local,
}

/// Opens a fresh websocket to the controller. The handshake runs with the
/// connect timeout as read timeout; afterwards reads poll at `poll_interval`.
pub(crate) fn open(config: &BridgeConfig) -> Result<Socket, BridgeError> {
    let (url, addr) = config.socket_addr()?;

    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
    let _ = stream.set_nodelay(true);
    stream.set_read_timeout(Some(config.connect_timeout))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let (ws, _response) = tungstenite::client(url.as_str(), stream).map_err(|e| match e {
        HandshakeError::Failure(tungstenite::Error::Io(io)) => BridgeError::Io(io),
        HandshakeError::Failure(other) => BridgeError::Handshake(other.to_string()),
        HandshakeError::Interrupted(_) => BridgeError::Handshake("handshake timed out".to_string()),
    })?;
    ws.get_ref().set_read_timeout(Some(config.poll_interval))?;

    Ok(ws)
}

/// Single reader/writer for one connection: drains the outbound queue in
/// FIFO order, then waits up to one poll interval for an inbound frame.
pub(crate) fn run_connection<F>(
    mut ws: Socket,
    outbound_rx: Receiver<String>,
    mut on_text: F,
) -> CloseReason
where
    F: FnMut(&str),
{
    loop {
        loop {
            match outbound_rx.try_recv() {
                Ok(text) => {
                    trace!(len = text.len(), "sending frame");
                    if let Err(e) = ws.send(Message::Text(text.into())) {
                        debug!(error = %e, "send failed, dropping connection");
                        let _ = ws.close(None);
                        return CloseReason::Remote;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let _ = ws.close(None);
                    let _ = ws.flush();
                    return CloseReason::Local;
                }
            }
        }

        match ws.read() {
            Ok(Message::Text(text)) => on_text(text.as_str()),
            Ok(Message::Close(frame)) => {
                debug!(?frame, "controller closed the connection");
                let _ = ws.flush();
                return CloseReason::Remote;
            }
            // Pings are answered by tungstenite on the next write or flush.
            Ok(Message::Ping(_)) => {
                let _ = ws.flush();
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                return CloseReason::Remote;
            }
            Err(e) => {
                warn!(error = %e, "websocket read failed");
                return CloseReason::Remote;
            }
        }
    }
}
