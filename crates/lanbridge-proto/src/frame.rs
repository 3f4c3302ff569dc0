//! Control frame codec
//!
//! Wire format: `{"type":<int>,"index":<int>,"c":"<string>"}` as UTF-8 JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors produced while decoding a control frame
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed control frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}

/// Control frame type codes. The numeric values are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum FrameType {
    SysOk,
    SysErr,
    NewConnection,
    RequestFinish,
    ClientBusy,
    GetConfig,
    SetConfig,
    /// A code this build does not know. Decoded and logged, never acted on.
    Unknown(i64),
}

impl FrameType {
    pub const SYS_OK: i64 = 0x1000;
    pub const SYS_ERR: i64 = 0x1001;
    pub const NEW_CONNECTION: i64 = 0x1002;
    pub const REQUEST_FINISH: i64 = 0x1003;
    pub const CLIENT_BUSY: i64 = 0x1004;
    pub const GET_CONFIG: i64 = 0x1005;
    pub const SET_CONFIG: i64 = 0x1006;

    pub fn code(self) -> i64 {
        match self {
            FrameType::SysOk => Self::SYS_OK,
            FrameType::SysErr => Self::SYS_ERR,
            FrameType::NewConnection => Self::NEW_CONNECTION,
            FrameType::RequestFinish => Self::REQUEST_FINISH,
            FrameType::ClientBusy => Self::CLIENT_BUSY,
            FrameType::GetConfig => Self::GET_CONFIG,
            FrameType::SetConfig => Self::SET_CONFIG,
            FrameType::Unknown(code) => code,
        }
    }

    /// Short symbolic name used in logs
    pub fn name(self) -> &'static str {
        match self {
            FrameType::SysOk => "OK",
            FrameType::SysErr => "Err",
            FrameType::NewConnection => "New-Conn",
            FrameType::RequestFinish => "Req-finish",
            FrameType::ClientBusy => "Cli-Busy",
            FrameType::GetConfig => "Get-Config",
            FrameType::SetConfig => "Set-Config",
            FrameType::Unknown(_) => "Unknown",
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, FrameType::Unknown(_))
    }
}

impl From<i64> for FrameType {
    fn from(code: i64) -> Self {
        match code {
            Self::SYS_OK => FrameType::SysOk,
            Self::SYS_ERR => FrameType::SysErr,
            Self::NEW_CONNECTION => FrameType::NewConnection,
            Self::REQUEST_FINISH => FrameType::RequestFinish,
            Self::CLIENT_BUSY => FrameType::ClientBusy,
            Self::GET_CONFIG => FrameType::GetConfig,
            Self::SET_CONFIG => FrameType::SetConfig,
            other => {
                tracing::warn!(code = format_args!("{:#x}", other), "Unknown control frame type");
                FrameType::Unknown(other)
            }
        }
    }
}

impl From<FrameType> for i64 {
    fn from(kind: FrameType) -> Self {
        kind.code()
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Unknown(code) => write!(f, "Unknown({:#x})", code),
            known => f.write_str(known.name()),
        }
    }
}

/// A control message exchanged on the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    /// Reserved for per-agent flow multiplexing; carried through untouched.
    pub index: i64,
    #[serde(rename = "c")]
    pub content: String,
}

impl ControlFrame {
    pub fn new(kind: FrameType) -> Self {
        Self {
            kind,
            index: 0,
            content: String::new(),
        }
    }

    pub fn with_content(kind: FrameType, content: impl Into<String>) -> Self {
        Self {
            kind,
            index: 0,
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_content(FrameType::SysErr, message)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode to the JSON text sent on the wire.
    ///
    /// # Panics
    ///
    /// Serializing this struct cannot fail; if it ever does the process must
    /// stop rather than silently drop a lifecycle message.
    pub fn encode(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| panic!("control frame {} failed to encode: {}", self.kind, e))
    }
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "T[{}] index={} content={:?}",
            self.kind, self.index, self.content
        )
    }
}

macro_rules! precomputed_frame {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        pub fn $name() -> &'static str {
            static FRAME: OnceLock<String> = OnceLock::new();
            FRAME.get_or_init(|| ControlFrame::new($kind).encode())
        }
    };
}

precomputed_frame!(
    /// Sent by whichever side ends a forwarding session
    request_finish_frame,
    FrameType::RequestFinish
);
precomputed_frame!(
    /// Agent reply to a `NewConnection` it cannot take
    client_busy_frame,
    FrameType::ClientBusy
);
precomputed_frame!(
    /// Broker asks an agent to dial its local target
    new_connection_frame,
    FrameType::NewConnection
);
precomputed_frame!(
    /// Broker asks an agent for its local target
    get_config_frame,
    FrameType::GetConfig
);
