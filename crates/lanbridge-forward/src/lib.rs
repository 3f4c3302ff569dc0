//! Forwarding engine
//!
//! Splices one local byte stream onto the tunnel and back. The same engine
//! runs on both ends: the broker feeds it the external client socket, the
//! agent feeds it the socket dialed to the local target.
//!
//! A session runs two tasks:
//! - **uplink** reads the local stream and sends each chunk as a binary tunnel message
//! - **downlink** drains a bounded queue filled by the frame-dispatch loop and
//!   writes the payloads to the local stream
//!
//! Whichever side notices the end first calls [`ForwardSession::finish`].

pub mod forwarder;
pub mod target;

pub use forwarder::{ForwardSession, ForwardStats, ForwardTasks, Teardown};
pub use target::ForwardTarget;

use lanbridge_proto::{DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_CAPACITY};
use lanbridge_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during forwarding
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Forward session is closed")]
    SessionClosed,

    #[error("Forward session already started")]
    AlreadyStarted,

    #[error("No forward target configured")]
    NoTarget,

    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {address} after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forward task failed: {0}")]
    Task(String),
}

/// Per-session tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardConfig {
    /// Largest payload read from the local stream per binary message
    pub chunk_size: usize,

    /// Payloads buffered between the dispatch loop and the downlink
    pub queue_capacity: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ForwardConfig {
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}
