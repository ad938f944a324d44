//! Session protocol engine for streaming frames from an imaging device service.
//!
//! A [`Session`] owns two execution contexts. The control thread runs the
//! connection state machine ([`SessionCore`]) and the [`Correlator`]; every
//! state transition and request is serialized there. The decode thread
//! ([`DecodeWorker`]) turns raw frame payloads into pixel buffers so slow
//! decodes never hold up status replies. Both feed the [`Dispatcher`], which
//! delivers [`SessionEvent`]s to registered [`SessionObserver`]s on a single
//! callback thread.

pub mod codec;
pub mod command;
pub mod config;
pub mod correlator;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod machine;
pub mod session;
pub mod state;

#[cfg(test)]
mod testutil;

pub use codec::{ImageCodec, PixelBuffer, PixelFormat, RawCodec};
pub use command::SessionCommand;
pub use config::SessionConfig;
pub use correlator::{Correlator, PendingRequest, RequestKind};
pub use decode::{DecodeJob, DecodeQueue, DecodeStats, DecodeWorker};
pub use dispatch::{Dispatcher, FrameBudget, ObserverId, SessionObserver};
pub use error::{CodecError, CorrelatorError, Result, SessionError};
pub use event::{DecodeFailure, DecodedFrame, EventSink, SessionEvent};
pub use machine::{InboundGate, SessionCore, StateHandle};
pub use session::Session;
pub use state::ConnectionState;

pub use probelink_channel::{ConnectError, SendError};
pub use probelink_wire::{CompressionFormat, ImageConfig, RawFrameMessage};
