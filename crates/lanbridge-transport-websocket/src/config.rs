//! WebSocket transport configuration

use lanbridge_proto::TUNNEL_PATH;
use lanbridge_transport::{TransportError, TransportResult};
use std::time::Duration;
use url::Url;

use crate::auth::BasicAuth;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upgrade path on the broker
    pub path: String,

    /// Interval between keep-alive pings sent by the dialing side
    pub keep_alive_interval: Duration,

    /// Maximum message size accepted from the peer
    pub max_message_size: usize,

    /// Credentials sent with (or expected on) the handshake
    pub auth: Option<BasicAuth>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: TUNNEL_PATH.to_string(),
            keep_alive_interval: Duration::from_secs(30),
            max_message_size: 16 * 1024 * 1024, // 16MB
            auth: None,
        }
    }
}

impl WebSocketConfig {
    /// Set WebSocket path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Use a `username:password` secret. An empty secret disables authentication.
    pub fn with_secret(mut self, secret: Option<&str>) -> Self {
        self.auth = BasicAuth::from_secret(secret);
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(format!(
                "WebSocket path must start with '/': {}",
                self.path
            )));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the broker endpoint.
    ///
    /// Accepts either a full `ws://` / `wss://` URL (used as-is) or a bare
    /// `host:port`, which becomes `ws://host:port{path}`.
    pub fn endpoint_url(&self, broker: &str) -> TransportResult<Url> {
        let raw = if broker.starts_with("ws://") || broker.starts_with("wss://") {
            broker.to_string()
        } else {
            format!("ws://{}{}", broker, self.path)
        };

        let url = Url::parse(&raw).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid broker address {}: {}", broker, e))
        })?;

        if url.host_str().is_none() {
            return Err(TransportError::ConfigurationError(format!(
                "Broker address has no host: {}",
                broker
            )));
        }
        Ok(url)
    }
}

/// Install the ring crypto provider once; needed before the first `wss://` dial
pub(crate) fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
