//! Channel adapter for the imaging device service.
//!
//! Hides the Unix-domain-socket transport and the wire framing behind three
//! seams: a [`Connector`] that binds a channel, the [`ChannelHandle`] used to
//! send requests and release the channel, and [`ChannelEvents`] through which
//! status replies and frame data arrive on the adapter's reader thread.
//!
//! The service side of the same protocol lives in [`service`]; the CLI
//! simulator and the integration tests run on it.

pub mod adapter;
pub mod config;
pub mod error;
pub mod handshake;
pub mod service;
pub mod stream;
pub mod uds;
pub mod uds_channel;

pub use adapter::{ChannelEvents, ChannelHandle, Connector};
pub use config::ChannelConfig;
pub use error::{ConnectError, Result, SendError, ServiceError, TransportError};
pub use service::{FrameSender, ServiceEndpoint, ServiceListener};
pub use stream::IpcStream;
pub use uds::UnixDomainSocket;
pub use uds_channel::{UdsChannel, UdsConnector};
