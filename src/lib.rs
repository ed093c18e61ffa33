//! bulkstream: length-prefixed bulk-ingest streaming.
//!
//! A producer stores records through a [`BulkIngestOperation`]; each record
//! becomes one `[len:u32-le][payload]` frame on a single long-lived request
//! opened through an [`IngestTransport`]. Consumers read the frames back with
//! a [`StreamParser`].

pub mod config;
pub mod error;
pub mod streaming;
pub mod transport;

pub use config::IngestConfig;
pub use error::{AggregateFailure, IngestError, Result};
pub use streaming::{
    BufferPool, BulkIngestOperation, Compression, CompressionKind, FrameRead, HandshakeBridge,
    IngestState, RecordArena, StreamParser,
};
pub use transport::{
    IngestTransport, KillOutcome, LoopbackTransport, OperationId, OperationState,
    OperationStatus,
};
