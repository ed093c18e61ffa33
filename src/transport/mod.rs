//! Connection layer seen by the operation controller.
//!
//! The controller never touches sockets. It drives an `IngestTransport`:
//! three short control calls plus one long-lived request whose body is the
//! frame stream. The long-lived request hands its writable body to the
//! producer through the `HandshakeBridge` and finalizes once the producer
//! signals completion.

pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::streaming::compression::Compression;
use crate::streaming::handshake::HandshakeBridge;

pub use local::{LoopbackTransport, ReceivedBody};

/// Server-assigned handle of one bulk-ingest operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(i64);

impl OperationId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Completed,
    Faulted,
    Canceled,
}

/// Answer to `get_operation_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationState {
    pub status: OperationStatus,
    /// Remote description of why the operation failed, if it did
    pub error: Option<String>,
}

impl OperationState {
    pub fn in_progress() -> Self {
        Self {
            status: OperationStatus::InProgress,
            error: None,
        }
    }

    pub fn failed(status: OperationStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    NotFound,
}

#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Reserve a new operation id on the remote side.
    async fn acquire_operation_id(&self) -> Result<OperationId>;

    /// Run the bulk-ingest request for `id`.
    ///
    /// Implementations call `bridge.resolve_sink` once the body channel is
    /// writable (or `bridge.fail_before_sink` if it never will be), then wait
    /// on `bridge.await_done` before finalizing the request. `compression`
    /// is announced out-of-band; the body bytes are already encoded.
    async fn open_ingest_stream(
        &self,
        id: OperationId,
        bridge: Arc<HandshakeBridge>,
        compression: Compression,
    ) -> Result<()>;

    async fn kill_operation(&self, id: OperationId) -> Result<KillOutcome>;

    async fn get_operation_state(&self, id: OperationId) -> Result<OperationState>;
}
