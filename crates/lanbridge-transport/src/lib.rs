//! Transport abstraction for the tunnel
//!
//! A tunnel is one long-lived, message-oriented connection carrying both
//! control frames (text) and forwarded payload (binary). Concrete transports
//! (see `lanbridge-transport-websocket`) adapt their socket into a
//! [`TunnelConnection`]; everything above this crate only sees
//! [`TunnelMessage`]s.

pub mod connection;
pub mod memory;

pub use connection::{ConnectionStats, TunnelConnection, TunnelReceiver, TunnelSender};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Handshake rejected with HTTP status {status}")]
    HandshakeRejected { status: u16 },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error is an orderly end of the connection rather than a fault
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// One message on the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMessage {
    /// Control frame (JSON)
    Text(String),
    /// Raw forwarded bytes
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl TunnelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Text(_) => "Text",
            TunnelMessage::Binary(_) => "Binary",
            TunnelMessage::Ping(_) => "Ping",
            TunnelMessage::Pong(_) => "Pong",
            TunnelMessage::Close => "Close",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TunnelMessage::Text(text) => text.len(),
            TunnelMessage::Binary(data) | TunnelMessage::Ping(data) | TunnelMessage::Pong(data) => {
                data.len()
            }
            TunnelMessage::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dials a broker and yields an established tunnel
#[async_trait]
pub trait TunnelConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> TransportResult<TunnelConnection>;

    /// Human readable endpoint, used in logs
    fn endpoint(&self) -> String;
}
