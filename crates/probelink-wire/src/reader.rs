use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{Result, WireError};

const READ_CHUNK: usize = 16 * 1024;

/// Blocking frame source over a byte stream.
///
/// Bytes are accumulated until a whole frame is buffered, so callers never
/// observe partial frames regardless of how the stream fragments them.
pub struct FrameReader<T> {
    inner: T,
    pending: BytesMut,
    max_payload: usize,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            pending: BytesMut::with_capacity(4 * READ_CHUNK),
            max_payload: config.max_payload_size,
        }
    }

    /// Blocks until the next frame is complete.
    ///
    /// End of stream yields [`WireError::ConnectionClosed`], whether it falls
    /// between frames or inside one.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.pending, self.max_payload)? {
                return Ok(frame);
            }
            if self.fill()? == 0 {
                return Err(WireError::ConnectionClosed);
            }
        }
    }

    /// Pulls one chunk from the stream into the pending buffer.
    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                other => break other?,
            }
        };
        self.pending.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
