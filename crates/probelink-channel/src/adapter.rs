use std::sync::Arc;

use probelink_wire::{OutboundMessage, RawFrameMessage, StatusReply, WireError};

use crate::error::{ConnectError, SendError};

/// Receives inbound traffic from a bound channel.
///
/// Called on the channel's reader thread, in the order the peer wrote the
/// messages. Implementations must hand work off without blocking.
pub trait ChannelEvents: Send + Sync {
    /// A status reply to an earlier tagged request.
    fn on_status_reply(&self, reply: StatusReply);

    /// An unsolicited frame pushed by the service. Ownership moves to the callee.
    fn on_frame(&self, frame: RawFrameMessage);

    /// A DATA message whose header could not be parsed.
    fn on_malformed_frame(&self, error: WireError);

    /// The peer dropped the channel. Never called after a local `disconnect`.
    fn on_closed(&self);
}

/// A bound, bidirectional channel to the device service.
pub trait ChannelHandle: Send {
    /// Queue a request for the peer without waiting on the transport.
    fn send(&mut self, message: &OutboundMessage) -> Result<(), SendError>;

    /// Release the channel. Safe to call more than once.
    fn disconnect(&mut self);

    /// Whether the channel is neither released nor dropped by the peer.
    fn is_open(&self) -> bool;
}

/// Establishes channels to the device service.
pub trait Connector: Send + Sync {
    /// Bind a channel, delivering its inbound traffic to `events`.
    ///
    /// May block for the duration of the transport handshake.
    fn connect(
        &self,
        events: Arc<dyn ChannelEvents>,
    ) -> Result<Box<dyn ChannelHandle>, ConnectError>;
}
