//! LAN-side agent
//!
//! Keeps a pool of tunnels open to the broker. Each tunnel waits for
//! `New-Conn`, dials the local target and forwards bytes until either side
//! finishes, then waits for the next command.
//!
//! # Example
//!
//! ```no_run
//! use lanbridge_agent::{AgentConfig, AgentPool};
//! use lanbridge_transport_websocket::WebSocketConnector;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::new("broker.example.com:8081", "127.0.0.1:22");
//! let connector = WebSocketConnector::new(&config.broker, Arc::new(config.websocket.clone()))?;
//! let pool = Arc::new(AgentPool::new(config, Arc::new(connector))?);
//! pool.run().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod pool;

pub use client::{AgentState, TunnelAgent};
pub use config::{AgentConfig, MIN_WORKERS};
pub use error::AgentError;
pub use pool::AgentPool;
