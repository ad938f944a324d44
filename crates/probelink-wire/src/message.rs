//! Logical messages exchanged with the device service.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::channel::{CONTROL, DATA};
use crate::codec::Frame;
use crate::error::{Result, WireError};

/// Opaque correlation identifier echoed back on a status reply.
pub type Tag = u32;

/// Status code the service uses to report success.
pub const STATUS_SUCCESS: i32 = 0;

/// Fixed DATA header: width (4) + height (4) + timestamp (8) + format (1).
pub const FRAME_HEADER_SIZE: usize = 17;

/// Compression applied by the device service to frame payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    /// Uncompressed RGBA8 pixels.
    Raw,
    Jpeg,
    Png,
}

impl CompressionFormat {
    /// Wire code carried in the DATA header.
    pub fn code(self) -> u8 {
        match self {
            CompressionFormat::Raw => 0,
            CompressionFormat::Jpeg => 1,
            CompressionFormat::Png => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CompressionFormat::Raw),
            1 => Ok(CompressionFormat::Jpeg),
            2 => Ok(CompressionFormat::Png),
            other => Err(WireError::UnknownCompression(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionFormat::Raw => "raw",
            CompressionFormat::Jpeg => "jpeg",
            CompressionFormat::Png => "png",
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(CompressionFormat::Raw),
            "jpeg" | "jpg" => Ok(CompressionFormat::Jpeg),
            "png" => Ok(CompressionFormat::Png),
            other => Err(format!("unknown compression format '{other}'")),
        }
    }
}

/// Requested output frame shape, sent once per registration.
///
/// Defaults to 400x400 uncompressed RGBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
    pub compression_format: CompressionFormat,
    /// Encoder quality, 0-100. Ignored for lossless formats.
    pub compression_quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: 400,
            height: 400,
            compression_format: CompressionFormat::Raw,
            compression_quality: 90,
        }
    }
}

/// Reply from the service to a tagged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub tag: Tag,
    pub status: i32,
}

impl StatusReply {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// CONTROL channel message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Handshake: the service accepted the connection.
    ServiceReady,
    /// Handshake: the service declined the connection (licensing, configuration).
    ServiceRefused { reason: String },
    RegisterClient { tag: Tag, client: String },
    UnregisterClient { tag: Tag },
    ConfigureImage {
        tag: Tag,
        #[serde(flatten)]
        image: ImageConfig,
    },
    StatusReply { tag: Tag, status: i32 },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(CONTROL, self.encode()?))
    }
}

/// Requests this side sends to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Establishes the service's callback route for `client`.
    RegisterClient { tag: Tag, client: String },
    UnregisterClient { tag: Tag },
    ConfigureImage { tag: Tag, image: ImageConfig },
}

impl OutboundMessage {
    pub fn tag(&self) -> Tag {
        match self {
            OutboundMessage::RegisterClient { tag, .. }
            | OutboundMessage::UnregisterClient { tag }
            | OutboundMessage::ConfigureImage { tag, .. } => *tag,
        }
    }

    pub fn to_control(&self) -> ControlMessage {
        match self {
            OutboundMessage::RegisterClient { tag, client } => ControlMessage::RegisterClient {
                tag: *tag,
                client: client.clone(),
            },
            OutboundMessage::UnregisterClient { tag } => {
                ControlMessage::UnregisterClient { tag: *tag }
            }
            OutboundMessage::ConfigureImage { tag, image } => ControlMessage::ConfigureImage {
                tag: *tag,
                image: *image,
            },
        }
    }

    pub fn to_frame(&self) -> Result<Frame> {
        self.to_control().to_frame()
    }
}

/// One compressed frame as pushed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrameMessage {
    pub width: u32,
    pub height: u32,
    pub timestamp_nanos: i64,
    pub compression_format: CompressionFormat,
    pub payload: Bytes,
}

impl RawFrameMessage {
    /// Encode as a DATA payload (header followed by the compressed bytes).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_i64_le(self.timestamp_nanos);
        buf.put_u8(self.compression_format.code());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a DATA payload. The compressed bytes are sliced, not copied.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < FRAME_HEADER_SIZE {
            return Err(WireError::TruncatedFrameData {
                len: payload.len(),
                needed: FRAME_HEADER_SIZE,
            });
        }
        let width = payload.get_u32_le();
        let height = payload.get_u32_le();
        let timestamp_nanos = payload.get_i64_le();
        let compression_format = CompressionFormat::from_code(payload.get_u8())?;
        Ok(Self {
            width,
            height,
            timestamp_nanos,
            compression_format,
            payload,
        })
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(DATA, self.encode())
    }
}

/// Messages the service sends to this side after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Status(StatusReply),
    Frame(RawFrameMessage),
    /// Any other well-formed CONTROL message; not part of the session protocol.
    Control(ControlMessage),
}

impl InboundMessage {
    pub fn from_frame(frame: Frame) -> Result<Self> {
        match frame.channel {
            CONTROL => match ControlMessage::decode(&frame.payload)? {
                ControlMessage::StatusReply { tag, status } => {
                    Ok(InboundMessage::Status(StatusReply { tag, status }))
                }
                other => Ok(InboundMessage::Control(other)),
            },
            DATA => Ok(InboundMessage::Frame(RawFrameMessage::decode(frame.payload)?)),
            other => Err(WireError::UnexpectedChannel(other)),
        }
    }
}
