//! Bulk-ingest streaming protocol.
//!
//! Moves an unbounded sequence of records from a producer to a consumer over
//! one long-lived request, without per-record round-trips.
//!
//! # Architecture
//!
//! ```text
//! Producer side:
//! +------------------+     +-------------+     +-------------+     +-----------+
//! | BulkIngestOp.    | --> | Frame codec | --> | BodyWriter  | --> | transport |
//! | store(record)    |     | (pooled buf)|     | (buf / gz)  |     |   sink    |
//! +------------------+     +-------------+     +-------------+     +-----------+
//!          |                                                              ^
//!          +---------------- HandshakeBridge (sink / done) ---------------+
//!
//! Consumer side:
//! +-----------+     +--------------+     +-------------+
//! | byte      | --> | StreamParser | --> | RecordArena |
//! | stream    |     | (4KB scratch)|     | (Bytes)     |
//! +-----------+     +--------------+     +-------------+
//! ```
//!
//! # Wire format
//!
//! ```text
//! stream := frame*
//! frame  := length:u32-le payload:byte[length]
//! ```
//!
//! Whole-stream compression (gzip, zstd) wraps the frame sequence and is
//! announced to the transport out-of-band.

pub mod command;
pub mod compression;
pub mod handshake;
pub mod operation;
pub mod parser;
pub mod pool;
pub mod protocol;

pub use command::{DecodedCommand, IdGenerator, Metadata, PutCommandEncoder, RecordEncoder};
pub use compression::{decode_body, BodyWriter, Compression, CompressionKind};
pub use handshake::{BoxedSink, HandshakeBridge};
pub use operation::{BulkIngestOperation, IngestState, OperationStats, KILL_NOT_FOUND_MESSAGE};
pub use parser::{FrameRead, ParserStats, RecordArena, StreamParser, SCRATCH_BUFFER_SIZE};
pub use pool::{BufferPool, MetricsSnapshot, PooledBuffer, SizeClass};
pub use protocol::{
    decode_length, encode_frame, encode_length, write_frame, EncodedFrame, FrameError,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
