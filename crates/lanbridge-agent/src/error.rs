//! Agent error types

use lanbridge_forward::ForwardError;
use lanbridge_transport::TransportError;
use thiserror::Error;

/// Errors that end an agent's tunnel session
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
