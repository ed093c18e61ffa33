//! Frame codec for the bulk-ingest stream.
//!
//! Wire format: a stream is zero or more frames written back-to-back with no
//! separators.
//!
//! ```text
//! stream := frame*
//! frame  := length:u32-le payload:byte[length]
//! ```
//!
//! A declared length of zero (or anything that reads as non-positive when
//! taken as a signed 32-bit value) means "no frame available" to the reader,
//! so the encoder refuses zero-length payloads instead of emitting a frame the
//! reader would mistake for end of stream.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::streaming::pool::{BufferPool, PooledBuffer};

/// Size of the little-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a declared frame length (64MB)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Largest payload the length prefix can describe without reading as
/// non-positive on the other side.
pub const MAX_PAYLOAD_LEN: usize = i32::MAX as usize;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("zero-length payload cannot be framed: a zero length prefix marks end of stream")]
    EmptyPayload,

    #[error("payload of {len} bytes does not fit a frame length prefix")]
    PayloadTooLarge { len: usize },

    #[error("frame size {size} exceeds maximum allowed size {max}")]
    FrameTooLarge { size: u32, max: u32 },
}

// =============================================================================
// Encoding
// =============================================================================

/// A frame laid out in a pooled buffer: `[len:u32-le][payload]`.
///
/// The buffer may be larger than the frame; only the first `len` bytes are
/// meaningful. Dropping the frame returns the buffer to its pool.
#[derive(Debug)]
pub struct EncodedFrame {
    buf: PooledBuffer,
    len: usize,
}

impl EncodedFrame {
    /// Frame bytes, prefix included
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload_len(&self) -> usize {
        self.len - LENGTH_PREFIX_SIZE
    }
}

/// Encode a payload length as the 4-byte little-endian prefix.
pub fn encode_length(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE], FrameError> {
    if len == 0 {
        return Err(FrameError::EmptyPayload);
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge { len });
    }
    Ok((len as u32).to_le_bytes())
}

/// Lay out one frame into a buffer leased from `pool`.
pub fn encode_frame(pool: &Arc<BufferPool>, payload: &[u8]) -> Result<EncodedFrame, FrameError> {
    let prefix = encode_length(payload.len())?;
    let len = LENGTH_PREFIX_SIZE + payload.len();

    let mut buf = pool.lease(len);
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&prefix);
    buf[LENGTH_PREFIX_SIZE..len].copy_from_slice(payload);

    Ok(EncodedFrame { buf, len })
}

/// Write a pre-encoded frame to the sink.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    frame: &EncodedFrame,
) -> std::io::Result<()> {
    w.write_all(frame.as_bytes()).await
}

// =============================================================================
// Decoding
// =============================================================================

/// Interpret a length prefix.
///
/// Returns `None` when the declared size is non-positive as a signed 32-bit
/// value, which readers treat exactly like end of stream.
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Option<u32> {
    let size = i32::from_le_bytes(prefix);
    if size <= 0 {
        None
    } else {
        Some(size as u32)
    }
}

/// Reject declared lengths above `max` before anything is allocated.
pub fn check_frame_size(size: u32, max: u32) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::FrameTooLarge { size, max });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let pool = Arc::new(BufferPool::new());
        let frame = encode_frame(&pool, b"users/1").unwrap();

        assert_eq!(frame.len(), 11);
        assert_eq!(frame.payload_len(), 7);
        assert_eq!(&frame.as_bytes()[..4], &[7, 0, 0, 0]);
        assert_eq!(&frame.as_bytes()[4..], b"users/1");
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        assert_eq!(encode_length(0x0102_0304).unwrap(), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(decode_length([0x04, 0x03, 0x02, 0x01]), Some(0x0102_0304));
    }

    #[test]
    fn test_zero_length_payload_rejected() {
        let pool = Arc::new(BufferPool::new());
        assert_eq!(encode_frame(&pool, b"").unwrap_err(), FrameError::EmptyPayload);
        assert_eq!(pool.metrics().snapshot().misses, 0);
    }

    #[test]
    fn test_decode_length_non_positive_is_no_frame() {
        assert_eq!(decode_length([0, 0, 0, 0]), None);
        assert_eq!(decode_length([0xFF, 0xFF, 0xFF, 0xFF]), None);
        assert_eq!(decode_length([0, 0, 0, 0x80]), None);
        assert_eq!(decode_length([1, 0, 0, 0]), Some(1));
    }

    #[test]
    fn test_check_frame_size() {
        assert!(check_frame_size(MAX_FRAME_SIZE, MAX_FRAME_SIZE).is_ok());
        assert_eq!(
            check_frame_size(MAX_FRAME_SIZE + 1, MAX_FRAME_SIZE),
            Err(FrameError::FrameTooLarge {
                size: MAX_FRAME_SIZE + 1,
                max: MAX_FRAME_SIZE
            })
        );
    }

    #[tokio::test]
    async fn test_write_frame_returns_buffer_to_pool() {
        let pool = Arc::new(BufferPool::new());
        let mut out = Vec::new();

        for payload in [&b"a"[..], b"bb", b"ccc"] {
            let frame = encode_frame(&pool, payload).unwrap();
            write_frame(&mut out, &frame).await.unwrap();
        }

        assert_eq!(out, b"\x01\0\0\0a\x02\0\0\0bb\x03\0\0\0ccc");
        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.returns, 3);
    }
}
