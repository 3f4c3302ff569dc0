//! WebSocket transport for the tunnel
//!
//! The agent dials the broker with tokio-tungstenite; the broker accepts the
//! upgrade inside its axum router. Both ends are adapted into a
//! [`lanbridge_transport::TunnelConnection`] so the protocol code above never
//! sees WebSocket types.
//!
//! Control frames travel as text messages, forwarded bytes as binary
//! messages, and liveness relies on WebSocket ping/pong.

pub mod adapter;
pub mod auth;
pub mod config;
pub mod connector;

pub use adapter::{from_axum, from_tungstenite};
pub use auth::BasicAuth;
pub use config::WebSocketConfig;
pub use connector::WebSocketConnector;
