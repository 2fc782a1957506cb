use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid controller url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme `{0}` (only ws:// is supported)")]
    UnsupportedScheme(String),
    #[error("controller url {0} does not resolve to an address")]
    NoAddress(String),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
}

impl BridgeError {
    /// Errors meaning "the controller is not there", as opposed to something
    /// going wrong once it was reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, BridgeError::Io(_))
    }
}
