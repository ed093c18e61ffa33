//! In-process transport.
//!
//! Hands out ids from a counter, opens each ingest body as an in-memory duplex
//! pipe and drains it concurrently with the producer's writes. Received bodies
//! are kept per operation until taken; taking one drops the operation. Kill requests close the pipe, so the
//! producer's next write to the sink fails the way a dropped connection does.
//!
//! Used by the `bulkstream` binary and by tests.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::streaming::compression::{decode_body, Compression, CompressionKind};
use crate::streaming::handshake::HandshakeBridge;
use crate::transport::{
    IngestTransport, KillOutcome, OperationId, OperationState, OperationStatus,
};

/// Duplex pipe capacity between producer and drain (64KB)
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Reason recorded for operations cancelled through `kill_operation`
pub const KILLED_REASON: &str = "operation was killed on request";

/// Body bytes received for one operation, as they came off the wire.
#[derive(Debug, Clone)]
pub struct ReceivedBody {
    pub compression: CompressionKind,
    pub bytes: Vec<u8>,
}

impl ReceivedBody {
    /// Frame stream with whole-stream compression removed.
    pub fn decoded(&self) -> io::Result<Vec<u8>> {
        decode_body(self.compression, &self.bytes)
    }
}

struct LoopbackOperation {
    state: OperationState,
    kill: CancellationToken,
    body: Option<ReceivedBody>,
}

pub struct LoopbackTransport {
    next_id: AtomicI64,
    pipe_capacity: usize,
    operations: Mutex<HashMap<OperationId, LoopbackOperation>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_pipe_capacity(pipe_capacity: usize) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pipe_capacity,
            operations: Mutex::new(HashMap::new()),
        }
    }

    fn with_operation<T>(
        &self,
        id: OperationId,
        f: impl FnOnce(&mut LoopbackOperation) -> T,
    ) -> Option<T> {
        let mut ops = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        ops.get_mut(&id).map(f)
    }

    /// Remove and return the body received for `id`.
    ///
    /// A body exists only once the request has finished, so taking it also
    /// forgets the operation: its state and kill handle go with it.
    pub fn take_body(&self, id: OperationId) -> Option<ReceivedBody> {
        let mut ops = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        if ops.get(&id)?.body.is_none() {
            return None;
        }
        ops.remove(&id).and_then(|op| op.body)
    }

    /// Operations still tracked, finished or not.
    pub fn tracked(&self) -> usize {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Last known state of `id`, without going through the async trait.
    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.with_operation(id, |op| op.state.clone())
    }

    fn finish(&self, id: OperationId, result: &Result<()>, body: ReceivedBody) {
        self.with_operation(id, |op| {
            op.body = Some(body);
            if op.state.status == OperationStatus::Canceled {
                return;
            }
            op.state = match result {
                Ok(()) => OperationState {
                    status: OperationStatus::Completed,
                    error: None,
                },
                Err(e) => OperationState::failed(OperationStatus::Faulted, e.to_string()),
            };
        });
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestTransport for LoopbackTransport {
    async fn acquire_operation_id(&self) -> Result<OperationId> {
        let id = OperationId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut ops = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        ops.insert(
            id,
            LoopbackOperation {
                state: OperationState::in_progress(),
                kill: CancellationToken::new(),
                body: None,
            },
        );
        Ok(id)
    }

    async fn open_ingest_stream(
        &self,
        id: OperationId,
        bridge: Arc<HandshakeBridge>,
        compression: Compression,
    ) -> Result<()> {
        let Some(kill) = self.with_operation(id, |op| op.kill.clone()) else {
            let err = IngestError::stream_unavailable(format!("unknown operation {}", id));
            bridge.fail_before_sink(IngestError::stream_unavailable(err.to_string()));
            return Err(err);
        };

        let (writer, mut reader) = tokio::io::duplex(self.pipe_capacity);
        bridge.resolve_sink(Box::new(writer))?;
        tracing::debug!(operation = %id, encoding = ?compression.content_encoding(), "loopback stream opened");

        let mut bytes = Vec::new();
        let drained = tokio::select! {
            biased;
            _ = kill.cancelled() => Err(IngestError::aborted(KILLED_REASON)),
            r = reader.read_to_end(&mut bytes) => r.map(|_| ()).map_err(|e| IngestError::StreamUnavailable {
                message: format!("failed to read ingest body of operation {}", id),
                source: Some(e),
            }),
        };
        drop(reader);

        let result = match drained {
            Ok(()) => bridge.await_done().await,
            Err(e) => Err(e),
        };

        tracing::debug!(operation = %id, bytes = bytes.len(), ok = result.is_ok(), "loopback stream finished");
        self.finish(
            id,
            &result,
            ReceivedBody {
                compression: compression.kind(),
                bytes,
            },
        );
        result
    }

    async fn kill_operation(&self, id: OperationId) -> Result<KillOutcome> {
        let killed = self.with_operation(id, |op| {
            if op.state.status != OperationStatus::InProgress {
                return false;
            }
            op.state = OperationState::failed(OperationStatus::Canceled, KILLED_REASON);
            op.kill.cancel();
            true
        });
        Ok(match killed {
            Some(true) => KillOutcome::Killed,
            _ => KillOutcome::NotFound,
        })
    }

    async fn get_operation_state(&self, id: OperationId) -> Result<OperationState> {
        self.state(id)
            .ok_or_else(|| IngestError::transport(format!("operation {} not found", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let transport = LoopbackTransport::new();
        assert_eq!(transport.acquire_operation_id().await.unwrap(), OperationId::new(1));
        assert_eq!(transport.acquire_operation_id().await.unwrap(), OperationId::new(2));
    }

    #[tokio::test]
    async fn test_body_is_received_after_done() {
        let transport = Arc::new(LoopbackTransport::new());
        let id = transport.acquire_operation_id().await.unwrap();
        let bridge = Arc::new(HandshakeBridge::new());

        let request = {
            let transport = Arc::clone(&transport);
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                transport
                    .open_ingest_stream(id, bridge, Compression::NONE)
                    .await
            })
        };

        let mut sink = bridge.await_sink().await.unwrap();
        sink.write_all(b"\x02\0\0\0hi").await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);
        bridge.signal_done().unwrap();

        request.await.unwrap().unwrap();
        assert_eq!(
            transport.state(id).unwrap().status,
            OperationStatus::Completed
        );
        let body = transport.take_body(id).unwrap();
        assert_eq!(body.bytes, b"\x02\0\0\0hi");
    }

    #[tokio::test]
    async fn test_taking_body_forgets_finished_operation() {
        let transport = Arc::new(LoopbackTransport::new());
        let pending = transport.acquire_operation_id().await.unwrap();
        let id = transport.acquire_operation_id().await.unwrap();
        let bridge = Arc::new(HandshakeBridge::new());

        let request = {
            let transport = Arc::clone(&transport);
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                transport
                    .open_ingest_stream(id, bridge, Compression::NONE)
                    .await
            })
        };

        let mut sink = bridge.await_sink().await.unwrap();
        sink.write_all(b"\x01\0\0\0x").await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);
        bridge.signal_done().unwrap();
        request.await.unwrap().unwrap();

        // No body yet for the pending one, so it stays tracked.
        assert!(transport.take_body(pending).is_none());
        assert_eq!(transport.tracked(), 2);

        assert!(transport.take_body(id).is_some());
        assert_eq!(transport.tracked(), 1);
        assert!(transport.state(id).is_none());
        assert!(transport.take_body(id).is_none());
        assert!(transport.state(pending).is_some());
    }

    #[tokio::test]
    async fn test_kill_unknown_operation_is_not_found() {
        let transport = LoopbackTransport::new();
        let outcome = transport.kill_operation(OperationId::new(99)).await.unwrap();
        assert_eq!(outcome, KillOutcome::NotFound);

        let err = transport
            .get_operation_state(OperationId::new(99))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_kill_reports_remote_error() {
        let transport = LoopbackTransport::new();
        let id = transport.acquire_operation_id().await.unwrap();

        assert_eq!(transport.kill_operation(id).await.unwrap(), KillOutcome::Killed);
        assert_eq!(transport.kill_operation(id).await.unwrap(), KillOutcome::NotFound);

        let state = transport.get_operation_state(id).await.unwrap();
        assert_eq!(state.status, OperationStatus::Canceled);
        assert_eq!(state.error.as_deref(), Some(KILLED_REASON));
    }
}
