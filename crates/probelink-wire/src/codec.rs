use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::channel_name;
use crate::error::{Result, WireError};

/// Bytes in front of every payload: magic, length, channel.
pub const HEADER_SIZE: usize = 8;

/// "PL"
pub const MAGIC: [u8; 2] = *b"PL";

/// Largest payload accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One unit of channel traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Header plus payload, as written to the socket.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frame ({} bytes)",
            channel_name(self.channel),
            self.payload.len()
        )
    }
}

/// The fixed-size prefix of a frame.
///
/// ```text
///  0      2            6          8
///  +------+------------+----------+----------------+
///  | "PL" | len u32 LE | chan u16 | payload (len)  |
///  +------+------------+----------+----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    len: usize,
    channel: u16,
}

impl FrameHeader {
    /// Parses the header at the front of `src` without consuming it.
    fn peek(src: &[u8]) -> Result<Option<Self>> {
        let Some(mut header) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        if header[..2] != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        header.advance(2);
        Ok(Some(Self {
            len: header.get_u32_le() as usize,
            channel: header.get_u16_le(),
        }))
    }

    fn put(self, dst: &mut BytesMut) {
        dst.put_slice(&MAGIC);
        dst.put_u32_le(self.len as u32);
        dst.put_u16_le(self.channel);
    }
}

/// Appends one encoded frame to `dst`.
pub fn encode_frame(channel: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = payload.len();
    if u32::try_from(len).is_err() {
        return Err(WireError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + len);
    FrameHeader { len, channel }.put(dst);
    dst.put_slice(payload);
    Ok(())
}

/// Splits the first complete frame off the front of `src`.
///
/// `Ok(None)` means more bytes are needed; `src` is left untouched in that
/// case. An oversized length is rejected as soon as the header is visible so
/// a hostile peer cannot make the reader buffer it.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(header) = FrameHeader::peek(src)? else {
        return Ok(None);
    };
    if header.len > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: header.len,
            max: max_payload,
        });
    }
    if src.len() < HEADER_SIZE + header.len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(Frame {
        channel: header.channel,
        payload: src.split_to(header.len).freeze(),
    }))
}

/// Limits applied by [`FrameReader`](crate::FrameReader) and
/// [`FrameWriter`](crate::FrameWriter).
#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
