use probelink_channel::ConnectError;

use crate::codec::PixelBuffer;
use crate::state::ConnectionState;

/// A frame ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp_nanos: i64,
    pub pixels: PixelBuffer,
}

/// A frame that reached the decode thread but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    /// Capture timestamp, when the header was readable.
    pub timestamp_nanos: Option<i64>,
    pub reason: String,
}

/// Notifications produced by the engine, in production order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// `true` once registered, `false` when a registered session ends.
    ConnectionChanged(bool),
    /// Outcome of the image configuration request.
    ConfigurationChanged(bool),
    /// The bind attempt failed; no teardown notification follows.
    ConnectFailed(ConnectError),
    Frame(DecodedFrame),
    DecodeFailed(DecodeFailure),
}

/// Where the control and decode threads send their events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}
