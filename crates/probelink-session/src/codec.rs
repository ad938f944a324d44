use bytes::Bytes;
use probelink_wire::{CompressionFormat, RawFrameMessage};

use crate::error::CodecError;

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per channel, red first.
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Decoded pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub format: PixelFormat,
    pub data: Bytes,
}

/// Turns compressed frame payloads into pixels.
///
/// Called only from the decode thread, so implementations may be slow but
/// must not block on the session.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, frame: &RawFrameMessage) -> Result<PixelBuffer, CodecError>;

    /// Whether frames in `format` can be decoded at all. A session refuses to
    /// start with an image configuration its codec cannot decode.
    fn supports(&self, _format: CompressionFormat) -> bool {
        true
    }
}

/// Passes uncompressed RGBA8 payloads through after validating their size.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ImageCodec for RawCodec {
    fn supports(&self, format: CompressionFormat) -> bool {
        format == CompressionFormat::Raw
    }

    fn decode(&self, frame: &RawFrameMessage) -> Result<PixelBuffer, CodecError> {
        if frame.compression_format != CompressionFormat::Raw {
            return Err(CodecError::Unsupported(frame.compression_format));
        }
        if frame.width == 0 || frame.height == 0 {
            return Err(CodecError::InvalidDimensions {
                width: frame.width,
                height: frame.height,
            });
        }

        let format = PixelFormat::Rgba8;
        let expected = (frame.width as usize)
            .checked_mul(frame.height as usize)
            .and_then(|pixels| pixels.checked_mul(format.bytes_per_pixel()))
            .ok_or(CodecError::InvalidDimensions {
                width: frame.width,
                height: frame.height,
            })?;
        if frame.payload.len() != expected {
            return Err(CodecError::LengthMismatch {
                expected,
                actual: frame.payload.len(),
            });
        }

        Ok(PixelBuffer {
            format,
            data: frame.payload.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(width: u32, height: u32, len: usize) -> RawFrameMessage {
        RawFrameMessage {
            width,
            height,
            timestamp_nanos: 0,
            compression_format: CompressionFormat::Raw,
            payload: Bytes::from(vec![0xAB; len]),
        }
    }

    #[test]
    fn raw_payload_passes_through() {
        let pixels = RawCodec.decode(&raw(2, 3, 24)).unwrap();
        assert_eq!(pixels.format, PixelFormat::Rgba8);
        assert_eq!(pixels.data.len(), 24);
    }

    #[test]
    fn short_payload_rejected() {
        assert_eq!(
            RawCodec.decode(&raw(2, 2, 15)),
            Err(CodecError::LengthMismatch {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn compressed_formats_unsupported() {
        let mut frame = raw(1, 1, 4);
        frame.compression_format = CompressionFormat::Jpeg;
        assert_eq!(
            RawCodec.decode(&frame),
            Err(CodecError::Unsupported(CompressionFormat::Jpeg))
        );
        assert!(RawCodec.supports(CompressionFormat::Raw));
        assert!(!RawCodec.supports(CompressionFormat::Jpeg));
        assert!(!RawCodec.supports(CompressionFormat::Png));
    }

    #[test]
    fn zero_dimensions_rejected() {
        assert!(matches!(
            RawCodec.decode(&raw(0, 4, 0)),
            Err(CodecError::InvalidDimensions { width: 0, height: 4 })
        ));
    }
}
