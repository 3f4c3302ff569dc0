//! Tunnel protocol definitions
//!
//! Control frames are carried as WebSocket text messages; forwarded payload
//! travels as binary messages with no extra framing. This crate owns the
//! control frame codec and the protocol constants shared by broker and agent.

pub mod frame;

pub use frame::{
    client_busy_frame, get_config_frame, new_connection_frame, request_finish_frame, CodecError,
    ControlFrame, FrameType,
};

/// Upgrade path the broker exposes for tunnel agents
pub const TUNNEL_PATH: &str = "/_ws4client";

/// Default read chunk size for forwarded streams
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default depth of the per-session downlink queue.
///
/// Memory held per active session is bounded by `DEFAULT_QUEUE_CAPACITY * DEFAULT_CHUNK_SIZE`.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;
