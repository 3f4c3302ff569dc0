//! Broker configuration

use lanbridge_forward::ForwardConfig;
use lanbridge_transport_websocket::WebSocketConfig;
use std::net::SocketAddr;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Public TCP listener; every accepted connection becomes one flow
    pub public_addr: SocketAddr,

    /// HTTP listener for tunnel upgrades and the admin page
    pub tunnel_addr: SocketAddr,

    pub websocket: WebSocketConfig,

    pub forward: ForwardConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            public_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            websocket: WebSocketConfig::default(),
            forward: ForwardConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_public_addr(mut self, addr: SocketAddr) -> Self {
        self.public_addr = addr;
        self
    }

    pub fn with_tunnel_addr(mut self, addr: SocketAddr) -> Self {
        self.tunnel_addr = addr;
        self
    }

    /// Shared secret (`username:password`); empty or `None` disables authentication
    pub fn with_secret(mut self, secret: Option<&str>) -> Self {
        self.websocket = self.websocket.with_secret(secret);
        self
    }

    pub fn with_websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    pub fn with_forward(mut self, forward: ForwardConfig) -> Self {
        self.forward = forward;
        self
    }
}
