use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{Result, WireError};

/// Blocking frame sink over a byte stream.
///
/// Each frame is encoded into a reusable scratch buffer and written in full
/// before the call returns.
pub struct FrameWriter<T> {
    inner: T,
    scratch: BytesMut,
    max_payload: usize,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(8 * 1024),
            max_payload: config.max_payload_size,
        }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame.channel, &frame.payload)
    }

    /// Frames `payload` for `channel` and flushes it to the stream.
    pub fn send(&mut self, channel: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        self.scratch.clear();
        encode_frame(channel, payload, &mut self.scratch)?;
        self.inner
            .write_all(&self.scratch)
            .and_then(|()| self.inner.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::WriteZero => WireError::ConnectionClosed,
                _ => WireError::Io(err),
            })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
