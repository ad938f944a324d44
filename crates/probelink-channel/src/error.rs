use std::path::PathBuf;

use probelink_wire::WireError;

/// Errors that can occur in socket transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Why a channel could not be established.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The service answered and declined (bad license, refused configuration).
    #[error("service refused the connection: {reason}")]
    RefusedConnection { reason: String },

    /// The service could not be reached at all.
    #[error("service unavailable: {reason}")]
    Unavailable { reason: String },
}

impl ConnectError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ConnectError::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Why a request could not be handed to the channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The peer endpoint is gone or the channel was released.
    #[error("channel broken: peer endpoint is gone")]
    ChannelBroken,

    /// The request could not be encoded.
    #[error("request encoding failed: {0}")]
    Encoding(String),
}

/// Errors on the device-service side of the protocol.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The client hung up.
    #[error("client disconnected")]
    Disconnected,
}
