//! Dialing side of the WebSocket transport

use async_trait::async_trait;
use lanbridge_transport::{TransportError, TransportResult, TunnelConnection, TunnelConnector};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;
use tracing::{debug, info};
use url::Url;

use crate::adapter::{from_tungstenite, map_tungstenite_error};
use crate::config::{ensure_crypto_provider, WebSocketConfig};

/// Dials one broker endpoint. Each [`TunnelConnector::connect`] call opens a fresh tunnel.
pub struct WebSocketConnector {
    url: Url,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl WebSocketConnector {
    /// `broker` is either `host:port` or a full `ws://` / `wss://` URL
    pub fn new(broker: &str, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;
        let url = config.endpoint_url(broker)?;

        if url.scheme() == "wss" {
            ensure_crypto_provider();
        }

        debug!("WebSocket connector created for {}", url);
        Ok(Self { url, config })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl TunnelConnector for WebSocketConnector {
    async fn connect(&self) -> TransportResult<TunnelConnection> {
        let host = self.url.host_str().ok_or_else(|| {
            TransportError::ConfigurationError(format!("Broker address has no host: {}", self.url))
        })?;
        let port = self.url.port_or_known_default().unwrap_or(80);

        debug!("Connecting to broker: {}", self.url);

        let tcp_stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let peer_addr = tcp_stream.peer_addr()?;
        let _ = tcp_stream.set_nodelay(true);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(map_tungstenite_error)?;
        if let Some(auth) = &self.config.auth {
            let value = HeaderValue::from_str(auth.header_value()).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid credentials: {}", e))
            })?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let mut protocol = ProtocolConfig::default();
        protocol.max_message_size = Some(self.config.max_message_size);

        let (ws_stream, _response) = tokio_tungstenite::client_async_tls_with_config(
            request,
            tcp_stream,
            Some(protocol),
            None,
        )
        .await
        .map_err(map_tungstenite_error)?;

        info!("Tunnel established to {}", self.url);

        Ok(from_tungstenite(
            ws_stream,
            peer_addr,
            Some(self.config.keep_alive_interval),
        ))
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}
