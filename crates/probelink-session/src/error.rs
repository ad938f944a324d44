use probelink_wire::CompressionFormat;

use crate::correlator::RequestKind;

/// Correlator contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    /// A request of this kind is still awaiting its status reply.
    #[error("a {0} request is already pending")]
    DuplicateRequest(RequestKind),
}

/// Why a frame payload could not be turned into pixels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{0} payloads are not supported by this codec")]
    Unsupported(CompressionFormat),

    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("payload is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

/// Errors surfaced to callers of [`Session`](crate::Session).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The external caller sent something other than start/stop.
    #[error("invalid session command '{0}'")]
    InvalidCommand(String),

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The session's control thread is gone.
    #[error("session has shut down")]
    Closed,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SessionError>;
