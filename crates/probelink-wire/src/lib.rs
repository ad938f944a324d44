//! Wire format for the probelink device channel.
//!
//! Every message travels in a frame with:
//! - A 2-byte magic number ("PL") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID
//!
//! CONTROL frames carry JSON control messages (registration, configuration,
//! status replies). DATA frames carry a fixed binary header followed by the
//! compressed image bytes.

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, CONTROL, DATA};
pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{Result, WireError};
pub use message::{
    CompressionFormat, ControlMessage, ImageConfig, InboundMessage, OutboundMessage,
    RawFrameMessage, StatusReply, Tag, FRAME_HEADER_SIZE, STATUS_SUCCESS,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
