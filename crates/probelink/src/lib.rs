//! Stream decoded frames from an imaging device service.
//!
//! probelink connects to a device service over a local socket, registers a
//! client, requests a frame shape and hands decoded frames to application
//! observers.
//!
//! # Crate Structure
//!
//! - [`wire`]: Length-prefixed framing and protocol messages
//! - [`channel`]: Channel adapter: socket transport, handshake, service side
//! - [`session`]: Session engine: state machine, correlator, decode worker, dispatcher
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use probelink::channel::{ChannelConfig, UdsConnector};
//! use probelink::session::{DecodedFrame, RawCodec, Session, SessionConfig, SessionObserver};
//!
//! struct Printer;
//!
//! impl SessionObserver for Printer {
//!     fn on_frame(&self, frame: &DecodedFrame) {
//!         println!("{}x{} @ {}", frame.width, frame.height, frame.timestamp_nanos);
//!     }
//! }
//!
//! let connector = UdsConnector::new(ChannelConfig::default());
//! let session = Session::start(Arc::new(connector), Arc::new(RawCodec), SessionConfig::default())?;
//! let printer = Arc::new(Printer);
//! session.subscribe(&printer);
//! session.connect()?;
//! # Ok::<(), probelink::session::SessionError>(())
//! ```

/// Re-export wire types.
pub mod wire {
    pub use probelink_wire::*;
}

/// Re-export channel types.
pub mod channel {
    pub use probelink_channel::*;
}

/// Re-export session types.
pub mod session {
    pub use probelink_session::*;
}
