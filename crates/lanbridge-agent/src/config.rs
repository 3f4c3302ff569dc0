//! Agent configuration

use lanbridge_forward::ForwardConfig;
use lanbridge_transport_websocket::WebSocketConfig;
use std::time::Duration;

use crate::error::AgentError;

/// Smallest worker count the command line accepts
pub const MIN_WORKERS: usize = 8;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker tunnel endpoint: `host:port` or a `ws://` / `wss://` URL
    pub broker: String,

    /// Initial local target (`host:port`) dialed for each flow
    pub target: String,

    /// Parallel tunnels kept open to the broker; each carries one flow at a time
    pub workers: usize,

    /// Pause before a worker reconnects after its tunnel ended
    pub reconnect_delay: Duration,

    /// Upper bound for dialing the local target
    pub dial_timeout: Duration,

    pub websocket: WebSocketConfig,

    pub forward: ForwardConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker: "114.114.114.114:8081".to_string(),
            target: "127.0.0.1:8000".to_string(),
            workers: MIN_WORKERS,
            reconnect_delay: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            websocket: WebSocketConfig::default(),
            forward: ForwardConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(broker: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Shared secret (`username:password`); empty or `None` sends no credentials
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

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.workers == 0 {
            return Err(AgentError::Configuration(
                "at least one worker is required".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(AgentError::Configuration(
                "dial timeout must be greater than zero".to_string(),
            ));
        }
        self.websocket
            .validate()
            .map_err(|e| AgentError::Configuration(e.to_string()))
    }
}
