/// Errors that can occur while encoding or decoding channel traffic.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x504C \"PL\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// A CONTROL payload could not be parsed.
    #[error("malformed control message: {0}")]
    Control(#[from] serde_json::Error),

    /// A DATA payload is shorter than its fixed header.
    #[error("truncated frame data ({len} bytes, header needs {needed})")]
    TruncatedFrameData { len: usize, needed: usize },

    /// A DATA payload names a compression format this side does not know.
    #[error("unknown compression format code {0}")]
    UnknownCompression(u8),

    /// A frame arrived on a channel that carries no protocol messages.
    #[error("unexpected channel {0}")]
    UnexpectedChannel(u16),
}

pub type Result<T> = std::result::Result<T, WireError>;
