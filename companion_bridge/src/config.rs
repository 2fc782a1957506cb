use crate::error::BridgeError;
use companion_protocol::DEFAULT_DEVICE_ID;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:28492";
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub device_id: String,
    /// Delay between reconnect-loop iterations, whatever their outcome.
    pub backoff: Duration,
    pub connect_timeout: Duration,
    /// Read timeout of the connection thread; bounds outbound latency.
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            device_id: DEFAULT_DEVICE_ID.to_string(),
            backoff: DEFAULT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl BridgeConfig {
    /// Defaults, overridden by `COMPANION_WS_URL`, `COMPANION_DEVICE_ID`
    /// and `COMPANION_BACKOFF_MS` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("COMPANION_WS_URL") {
            config.url = url.trim().to_string();
        }
        if let Ok(id) = std::env::var("COMPANION_DEVICE_ID") {
            config.device_id = id.trim().to_string();
        }
        if let Some(ms) = std::env::var("COMPANION_BACKOFF_MS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            config.backoff = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<Url, BridgeError> {
        let url = Url::parse(&self.url)?;
        if url.scheme() != "ws" {
            return Err(BridgeError::UnsupportedScheme(url.scheme().to_string()));
        }
        Ok(url)
    }

    pub(crate) fn socket_addr(&self) -> Result<(Url, SocketAddr), BridgeError> {
        let url = self.validate()?;
        let addr = url
            .socket_addrs(|| None)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::NoAddress(self.url.clone()))?;
        Ok((url, addr))
    }
}
