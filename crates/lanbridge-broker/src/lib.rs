//! Broker side of the LAN tunnel
//!
//! Agents inside the LAN dial in over WebSocket and register here. Each
//! connection accepted on the public TCP listener is handed to a free
//! agent, which dials its local target; bytes are then spliced both ways
//! over the agent's tunnel.
//!
//! # Example
//!
//! ```no_run
//! use lanbridge_broker::{Broker, BrokerConfig};
//!
//! # async fn run() -> Result<(), lanbridge_broker::BrokerError> {
//! let config = BrokerConfig::default().with_secret(Some("user:pass"));
//! Broker::new(config).run().await
//! # }
//! ```

pub mod admin;
pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod session;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, RegistryError};
pub use registry::{AgentRegistry, AgentSnapshot, RegisteredAgent};
pub use session::CLIENT_BUSY_MESSAGE;
