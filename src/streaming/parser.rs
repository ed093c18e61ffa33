//! Consumer side of the bulk-ingest stream.
//!
//! `StreamParser` reads frames sequentially from any `AsyncRead` and copies
//! each payload into a caller-supplied `RecordArena`. All reads go through one
//! 4KB scratch buffer leased from the pool when the parser is created and
//! returned when it is dropped.
//!
//! End of input is reported two ways. `next_frame` keeps clean end and
//! truncation apart (`FrameRead::End` vs `FrameRead::Truncated`);
//! `next_record` folds both into `None` for callers that only iterate.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::streaming::pool::{BufferPool, PooledBuffer};
use crate::streaming::protocol::{check_frame_size, decode_length, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Scratch buffer size used for every read from the stream
pub const SCRATCH_BUFFER_SIZE: usize = 4096;

/// Outcome of reading one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    /// A complete payload, committed from the arena
    Record(Bytes),
    /// Stream ended at a frame boundary, or declared a non-positive length
    End,
    /// Stream ended inside a frame; the partial payload was released
    Truncated { expected: usize, received: usize },
}

// =============================================================================
// RecordArena
// =============================================================================

/// Counters describing arena usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub allocations: u64,
    pub commits: u64,
    pub releases: u64,
}

/// Target memory for decoded records.
///
/// One allocation is pending at a time. A committed record is handed out as
/// `Bytes` and stays valid for as long as the caller holds it; the arena
/// reuses freed capacity for later records.
#[derive(Debug, Default)]
pub struct RecordArena {
    buf: BytesMut,
    stats: ArenaStats,
}

impl RecordArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            stats: ArenaStats::default(),
        }
    }

    /// Reserve `size` zeroed bytes for the next record, dropping any
    /// uncommitted allocation.
    pub fn allocate(&mut self, size: usize) -> &mut [u8] {
        self.buf.clear();
        self.buf.resize(size, 0);
        self.stats.allocations += 1;
        &mut self.buf[..]
    }

    /// Bytes of the pending allocation
    pub fn pending(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Hand the pending allocation to the caller.
    pub fn commit(&mut self) -> Bytes {
        self.stats.commits += 1;
        self.buf.split().freeze()
    }

    /// Give back the pending allocation without producing a record.
    pub fn release(&mut self) {
        self.buf.clear();
        self.stats.releases += 1;
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }
}

// =============================================================================
// StreamParser
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    pub records: u64,
    pub payload_bytes: u64,
    pub truncated: u64,
}

pub struct StreamParser<R> {
    reader: R,
    scratch: PooledBuffer,
    max_frame_size: u32,
    stats: ParserStats,
}

impl<R: AsyncRead + Unpin> StreamParser<R> {
    pub fn new(reader: R, pool: &Arc<BufferPool>) -> Self {
        Self {
            reader,
            scratch: pool.lease(SCRATCH_BUFFER_SIZE),
            max_frame_size: MAX_FRAME_SIZE,
            stats: ParserStats::default(),
        }
    }

    /// Reject frames declaring more than `max` payload bytes.
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Read up to `len` bytes into the start of the scratch buffer, looping
    /// until `len` bytes arrived or the stream ended.
    async fn fill_scratch(&mut self, len: usize) -> Result<usize> {
        let mut filled = 0;
        while filled < len {
            let n = self.reader.read(&mut self.scratch[filled..len]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read the next frame into `arena`.
    ///
    /// I/O errors and declared lengths above the configured maximum are
    /// returned as errors; running out of input never is.
    pub async fn next_frame(&mut self, arena: &mut RecordArena) -> Result<FrameRead> {
        let got = self.fill_scratch(LENGTH_PREFIX_SIZE).await?;
        if got == 0 {
            return Ok(FrameRead::End);
        }
        if got < LENGTH_PREFIX_SIZE {
            self.stats.truncated += 1;
            tracing::warn!(received = got, "stream ended inside a frame length prefix");
            return Ok(FrameRead::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                received: got,
            });
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.scratch[..LENGTH_PREFIX_SIZE]);
        let Some(size) = decode_length(prefix) else {
            return Ok(FrameRead::End);
        };
        check_frame_size(size, self.max_frame_size)?;

        let size = size as usize;
        arena.allocate(size);

        let mut copied = 0;
        while copied < size {
            let chunk = (size - copied).min(self.scratch.len());
            let n = match self.reader.read(&mut self.scratch[..chunk]).await {
                Ok(n) => n,
                Err(e) => {
                    arena.release();
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            arena.pending()[copied..copied + n].copy_from_slice(&self.scratch[..n]);
            copied += n;
        }

        if copied < size {
            arena.release();
            self.stats.truncated += 1;
            tracing::warn!(expected = size, received = copied, "stream ended inside a frame payload");
            return Ok(FrameRead::Truncated {
                expected: size,
                received: copied,
            });
        }

        self.stats.records += 1;
        self.stats.payload_bytes += size as u64;
        Ok(FrameRead::Record(arena.commit()))
    }

    /// Next record, or `None` at end of stream or on truncation.
    pub async fn next_record(&mut self, arena: &mut RecordArena) -> Result<Option<Bytes>> {
        match self.next_frame(arena).await? {
            FrameRead::Record(record) => Ok(Some(record)),
            FrameRead::End | FrameRead::Truncated { .. } => Ok(None),
        }
    }

    /// Release the scratch buffer and hand back the reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}
