//! Broker error types

use lanbridge_forward::ForwardError;
use lanbridge_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No registered agent is free. The text is written verbatim to the rejected socket.
    #[error("no free-websocket connect found.")]
    NoFreeAgent,

    #[error("Agent {0} is already registered with an open tunnel")]
    DuplicateIdentity(SocketAddr),
}

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Failed to bind to {address}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: SocketAddr,
        port: u16,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    pub fn is_duplicate_identity(&self) -> bool {
        matches!(
            self,
            BrokerError::Registry(RegistryError::DuplicateIdentity(_))
        )
    }
}
