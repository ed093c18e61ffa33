//! Operation controller: the producer-facing bulk-ingest API.
//!
//! A `BulkIngestOperation` turns `store` calls into frames on one long-lived
//! ingest request. Nothing touches the network until the first valid `store`:
//!
//! ```text
//! store ─▶ validate id ─▶ encode ─▶ [acquire id] ─▶ [open stream] ─▶ write frame
//!                                   cached once     spawns send task
//! ```
//!
//! The send task runs `IngestTransport::open_ingest_stream` concurrently with
//! the producer's writes; the two meet through the `HandshakeBridge` and are
//! joined in `dispose`.
//!
//! # Failure reconciliation
//!
//! `dispose` can observe up to three independent failures. They are reported
//! in this order:
//!
//! 1. remote-reported error (from `get_operation_state`), surfaced as
//!    `IngestError::Aborted` carrying the local failures as `causes`
//! 2. local flush failure
//! 3. background send task failure
//!
//! Without a remote error, a single local failure is returned as is and two
//! are returned as `IngestError::Aggregate` in flush, task order.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::error::{AggregateFailure, IngestError, Result};
use crate::streaming::command::{validate_id, IdGenerator, Metadata, PutCommandEncoder, RecordEncoder};
use crate::streaming::compression::{BodyWriter, Compression};
use crate::streaming::handshake::HandshakeBridge;
use crate::streaming::pool::BufferPool;
use crate::streaming::protocol::encode_frame;
use crate::transport::{IngestTransport, KillOutcome, OperationId};

pub const KILL_NOT_FOUND_MESSAGE: &str =
    "Unable to kill this bulk insert operation, because it was not found on the server.";

fn write_failed_message(id: &str) -> String {
    format!("Write to stream failed at document with id {}.", id)
}

/// Local lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    NotStarted,
    AcquiringId,
    StreamOpening,
    Streaming,
    Completing,
    Completed,
    Aborted,
    Errored,
}

impl IngestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Errored)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    /// Records written to the body
    pub records: u64,
    /// Framed bytes written, length prefixes included, before compression
    pub frame_bytes: u64,
}

pub struct BulkIngestOperation {
    transport: Arc<dyn IngestTransport>,
    config: IngestConfig,
    pool: Arc<BufferPool>,
    bridge: Arc<HandshakeBridge>,
    encoder: Box<dyn RecordEncoder>,
    ids: IdGenerator,
    cancel: CancellationToken,

    state: IngestState,
    operation_id: Option<OperationId>,
    writer: Option<BodyWriter>,
    send_task: Option<JoinHandle<Result<()>>>,
    stats: OperationStats,
    disposed: bool,
}

/// Run `fut` unless `token` fires first.
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(IngestError::Cancelled),
        r = fut => r,
    }
}

/// Body of the background send task.
async fn run_send_task(
    transport: Arc<dyn IngestTransport>,
    id: OperationId,
    bridge: Arc<HandshakeBridge>,
    compression: Compression,
    timeout: Duration,
) -> Result<()> {
    let request = transport.open_ingest_stream(id, Arc::clone(&bridge), compression);
    let result = match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::BackgroundTask {
            message: format!("ingest request did not complete within {:?}", timeout),
        }),
    };

    if let Err(e) = &result {
        // Releases a producer still waiting for the sink.
        bridge.fail_before_sink(IngestError::stream_unavailable(e.to_string()));
    }
    result
}

impl BulkIngestOperation {
    pub fn new(transport: Arc<dyn IngestTransport>, config: IngestConfig) -> Result<Self> {
        config.validate()?;
        let ids = IdGenerator::new(config.id_prefix.clone());
        Ok(Self {
            transport,
            config,
            pool: BufferPool::shared(),
            bridge: Arc::new(HandshakeBridge::new()),
            encoder: Box::new(PutCommandEncoder),
            ids,
            cancel: CancellationToken::new(),
            state: IngestState::NotStarted,
            operation_id: None,
            writer: None,
            send_task: None,
            stats: OperationStats::default(),
            disposed: false,
        })
    }

    /// Frame buffers come from `pool` instead of the process-wide pool.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_encoder(mut self, encoder: Box<dyn RecordEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Honour `token` at every suspension point of `store`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn operation_id(&self) -> Option<OperationId> {
        self.operation_id
    }

    pub fn stats(&self) -> OperationStats {
        self.stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn compression(&self) -> Compression {
        self.config.compression()
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Frame `record` under `id` and write it to the ingest stream.
    ///
    /// The id is checked before anything else; an invalid id never reaches
    /// the transport. Returns the id the record was stored under.
    pub async fn store<T: Serialize + ?Sized>(
        &mut self,
        record: &T,
        id: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        validate_id(id)?;
        self.ensure_usable()?;

        let payload = self
            .encoder
            .encode(id, serde_json::to_value(record)?, metadata)?;
        let frame = encode_frame(&self.pool, &payload)?;

        let op_id = self.wait_for_id().await?;
        self.ensure_stream(op_id).await?;
        self.state = IngestState::Streaming;

        let Some(writer) = self.writer.as_mut() else {
            return Err(IngestError::protocol_violation("ingest stream is not open"));
        };
        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(None),
            r = writer.write_all(frame.as_bytes()) => r.map_err(Some),
        };

        match written {
            Ok(()) => {
                self.stats.records += 1;
                self.stats.frame_bytes += frame.len() as u64;
                tracing::trace!(operation = %op_id, id, bytes = frame.len(), "record written");
                Ok(id.to_string())
            }
            Err(None) => {
                // A frame may be half written; the stream cannot be continued.
                self.state = IngestState::Errored;
                Err(IngestError::Cancelled)
            }
            Err(Some(e)) => {
                self.state = IngestState::Errored;
                Err(self.write_failure(op_id, id, e).await)
            }
        }
    }

    /// Store `record` under the `@id` from `metadata`, or under a generated
    /// `<prefix>/<n>` id.
    pub async fn store_auto<T: Serialize + ?Sized>(
        &mut self,
        record: &T,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        let id = self.ids.resolve(metadata);
        self.store(record, &id, metadata).await
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed {
            return Err(IngestError::protocol_violation(
                "bulk ingest operation was already disposed",
            ));
        }
        match self.state {
            IngestState::Errored | IngestState::Aborted | IngestState::Completed => {
                Err(IngestError::protocol_violation(format!(
                    "cannot store into a bulk ingest operation in state {:?}",
                    self.state
                )))
            }
            _ => Ok(()),
        }
    }

    async fn wait_for_id(&mut self) -> Result<OperationId> {
        if let Some(id) = self.operation_id {
            return Ok(id);
        }

        self.state = IngestState::AcquiringId;
        match cancellable(&self.cancel, self.transport.acquire_operation_id()).await {
            Ok(id) => {
                tracing::debug!(operation = %id, "bulk ingest operation id acquired");
                self.operation_id = Some(id);
                Ok(id)
            }
            Err(e) => {
                self.state = IngestState::NotStarted;
                Err(e)
            }
        }
    }

    async fn ensure_stream(&mut self, id: OperationId) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        if self.send_task.is_some() {
            self.state = IngestState::Errored;
            return Err(IngestError::protocol_violation(
                "ingest stream failed to open earlier in this operation",
            ));
        }

        self.state = IngestState::StreamOpening;
        let compression = self.config.compression();
        self.send_task = Some(tokio::spawn(run_send_task(
            Arc::clone(&self.transport),
            id,
            Arc::clone(&self.bridge),
            compression,
            self.config.request_timeout(),
        )));

        let opened = match cancellable(&self.cancel, self.bridge.await_sink()).await {
            Ok(sink) => BodyWriter::new(sink, compression, self.config.write_buffer_size),
            Err(e) => Err(e),
        };
        match opened {
            Ok(writer) => {
                tracing::debug!(operation = %id, encoding = ?compression.content_encoding(), "ingest stream opened");
                self.writer = Some(writer);
                Ok(())
            }
            Err(e) => {
                self.state = IngestState::Errored;
                Err(e)
            }
        }
    }

    /// Explain a failed write, preferring the remote side's account.
    async fn write_failure(&self, op_id: OperationId, id: &str, source: io::Error) -> IngestError {
        let message = write_failed_message(id);
        // The request must not finalize as if the stream ended cleanly.
        self.bridge.fail_after_sink(IngestError::aborted(message.clone()));

        let local = IngestError::StreamUnavailable {
            message,
            source: Some(source),
        };
        match self.remote_error(op_id).await {
            Some(reason) => {
                tracing::debug!(operation = %op_id, %reason, "write failure explained by remote error");
                IngestError::Aborted {
                    reason,
                    causes: vec![local],
                }
            }
            None => local,
        }
    }

    /// Best-effort query of the remote error; query failures are logged and
    /// treated as "no remote error".
    async fn remote_error(&self, op_id: OperationId) -> Option<String> {
        match self.transport.get_operation_state(op_id).await {
            Ok(state) => state.error,
            Err(e) => {
                tracing::warn!(operation = %op_id, error = %e, "failed to query remote operation state");
                None
            }
        }
    }

    // =========================================================================
    // Abort
    // =========================================================================

    /// Kill the remote operation.
    ///
    /// No-op when no id was ever acquired. A kill the remote side cannot
    /// confirm is reported as `Aborted`.
    pub async fn abort(&mut self) -> Result<()> {
        let Some(op_id) = self.operation_id else {
            return Ok(());
        };

        let outcome = self.transport.kill_operation(op_id).await;
        self.state = IngestState::Aborted;
        match outcome {
            Ok(KillOutcome::Killed) => {
                tracing::info!(operation = %op_id, "bulk ingest operation killed");
                Ok(())
            }
            Ok(KillOutcome::NotFound) => Err(IngestError::aborted(KILL_NOT_FOUND_MESSAGE)),
            Err(e) => Err(IngestError::Aborted {
                reason: KILL_NOT_FOUND_MESSAGE.to_string(),
                causes: vec![e],
            }),
        }
    }

    // =========================================================================
    // Dispose
    // =========================================================================

    /// Finish the stream, join the send task and report every failure seen.
    ///
    /// Idempotent: later calls return `Ok(())` without touching the
    /// transport. Resources are released even when an error is returned.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let result = self.complete().await;
        self.release_resources();

        match &result {
            Ok(()) => {
                if !self.state.is_terminal() {
                    self.state = IngestState::Completed;
                }
                if let Some(op_id) = self.operation_id {
                    tracing::info!(
                        operation = %op_id,
                        records = self.stats.records,
                        bytes = self.stats.frame_bytes,
                        "bulk ingest completed"
                    );
                }
            }
            Err(e) => {
                self.state = if e.is_aborted() {
                    IngestState::Aborted
                } else {
                    IngestState::Errored
                };
            }
        }
        result
    }

    async fn complete(&mut self) -> Result<()> {
        if !self.state.is_terminal() && self.state != IngestState::NotStarted {
            self.state = IngestState::Completing;
        }

        let flush_error = match self.writer.as_mut() {
            Some(writer) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Some(IngestError::Cancelled),
                r = writer.finish() => r.err().map(|e| IngestError::StreamUnavailable {
                    message: "failed to flush the ingest stream".to_string(),
                    source: Some(e),
                }),
            },
            None => None,
        };
        self.writer = None;

        if !self.bridge.is_done_settled() {
            if let Err(e) = self.bridge.signal_done() {
                tracing::warn!(error = %e, "failed to signal ingest stream completion");
            }
        }

        let Some(op_id) = self.operation_id else {
            return Ok(());
        };

        let task_error = match self.send_task.take() {
            Some(handle) => self.join_send_task(handle).await,
            None => None,
        };

        let mut causes: Vec<IngestError> = flush_error.into_iter().chain(task_error).collect();
        // Flush and join both observe the same token; report it once.
        causes.dedup_by(|a, b| {
            matches!((a, b), (IngestError::Cancelled, IngestError::Cancelled))
        });
        if causes.is_empty() {
            return Ok(());
        }

        if let Some(reason) = self.remote_error(op_id).await {
            return Err(IngestError::Aborted { reason, causes });
        }
        if causes.len() == 1 {
            return Err(causes.remove(0));
        }
        Err(IngestError::Aggregate(AggregateFailure::new(causes)))
    }

    async fn join_send_task(&self, mut handle: JoinHandle<Result<()>>) -> Option<IngestError> {
        let joined = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                handle.abort();
                return Some(IngestError::Cancelled);
            }
            joined = &mut handle => joined,
        };
        match joined {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => Some(IngestError::BackgroundTask {
                message: e.to_string(),
            }),
        }
    }

    fn release_resources(&mut self) {
        self.writer = None;
        self.bridge.close();
        if let Some(handle) = self.send_task.take() {
            handle.abort();
        }
    }
}

impl Drop for BulkIngestOperation {
    fn drop(&mut self) {
        if !self.disposed && self.operation_id.is_some() {
            tracing::warn!(
                operation = ?self.operation_id,
                "bulk ingest operation dropped without dispose"
            );
        }
        if let Some(handle) = self.send_task.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for BulkIngestOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkIngestOperation")
            .field("state", &self.state)
            .field("operation_id", &self.operation_id)
            .field("stats", &self.stats)
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::command::DecodedCommand;
    use crate::streaming::parser::{RecordArena, StreamParser};
    use crate::transport::LoopbackTransport;
    use serde_json::json;

    fn loopback() -> (Arc<LoopbackTransport>, BulkIngestOperation) {
        let transport = Arc::new(LoopbackTransport::new());
        let op = BulkIngestOperation::new(transport.clone(), IngestConfig::default())
            .unwrap()
            .with_pool(Arc::new(BufferPool::new()));
        (transport, op)
    }

    async fn parse_all(data: &[u8]) -> Vec<DecodedCommand> {
        let pool = Arc::new(BufferPool::new());
        let mut parser = StreamParser::new(data, &pool);
        let mut arena = RecordArena::new();
        let mut out = Vec::new();
        while let Some(record) = parser.next_record(&mut arena).await.unwrap() {
            out.push(DecodedCommand::from_slice(&record).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_store_and_dispose() {
        let (transport, mut op) = loopback();
        assert_eq!(op.state(), IngestState::NotStarted);

        op.store(&json!({"name": "ada"}), "users/1", None).await.unwrap();
        assert_eq!(op.state(), IngestState::Streaming);
        op.store(&json!({"name": "grace"}), "users/2", None).await.unwrap();

        op.dispose().await.unwrap();
        assert_eq!(op.state(), IngestState::Completed);
        assert_eq!(op.stats().records, 2);

        let id = op.operation_id().unwrap();
        let body = transport.take_body(id).unwrap();
        assert_eq!(body.bytes.len() as u64, op.stats().frame_bytes);

        let commands = parse_all(&body.decoded().unwrap()).await;
        let ids: Vec<_> = commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["users/1", "users/2"]);
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected_before_network() {
        let (_transport, mut op) = loopback();

        let err = op.store(&json!({}), "", None).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        let err = op.store(&json!({}), "users/1|", None).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));

        assert_eq!(op.operation_id(), None);
        assert_eq!(op.state(), IngestState::NotStarted);
    }

    #[tokio::test]
    async fn test_dispose_without_store() {
        let (_transport, mut op) = loopback();
        op.dispose().await.unwrap();
        op.dispose().await.unwrap();
        assert_eq!(op.operation_id(), None);
    }

    #[tokio::test]
    async fn test_store_after_dispose_is_rejected() {
        let (_transport, mut op) = loopback();
        op.store(&json!({}), "users/1", None).await.unwrap();
        op.dispose().await.unwrap();

        let err = op.store(&json!({}), "users/2", None).await.unwrap_err();
        assert!(matches!(err, IngestError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_store_auto_uses_metadata_id() {
        let (transport, mut op) = loopback();

        let mut metadata = Metadata::new();
        metadata.insert("@id".into(), json!("users/ada"));
        let first = op.store_auto(&json!({"n": 1}), Some(&metadata)).await.unwrap();
        let second = op.store_auto(&json!({"n": 2}), None).await.unwrap();
        assert_eq!(first, "users/ada");
        assert_eq!(second, "records/1");

        op.dispose().await.unwrap();
        let body = transport.take_body(op.operation_id().unwrap()).unwrap();
        let commands = parse_all(&body.bytes).await;
        assert_eq!(commands[0].metadata().unwrap()["@id"], json!("users/ada"));
        assert_eq!(commands[1].id, "records/1");
    }

    #[tokio::test]
    async fn test_abort_kills_remote_operation() {
        let (transport, mut op) = loopback();
        op.abort().await.unwrap();

        op.store(&json!({}), "users/1", None).await.unwrap();
        op.abort().await.unwrap();
        assert_eq!(op.state(), IngestState::Aborted);

        let err = op.abort().await.unwrap_err();
        assert_eq!(err.abort_reason(), Some(KILL_NOT_FOUND_MESSAGE));

        let err = op.dispose().await.unwrap_err();
        assert_eq!(
            err.abort_reason(),
            Some(crate::transport::local::KILLED_REASON)
        );
        assert!(transport.take_body(op.operation_id().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_gzip_stream() {
        let transport = Arc::new(LoopbackTransport::new());
        let config = IngestConfig::default()
            .with_compression(crate::streaming::compression::CompressionKind::Gzip, None);
        let mut op = BulkIngestOperation::new(transport.clone(), config).unwrap();

        for i in 1..=50 {
            op.store(&json!({"n": i}), &format!("users/{}", i), None)
                .await
                .unwrap();
        }
        op.dispose().await.unwrap();

        let body = transport.take_body(op.operation_id().unwrap()).unwrap();
        assert!((body.bytes.len() as u64) < op.stats().frame_bytes);
        let commands = parse_all(&body.decoded().unwrap()).await;
        assert_eq!(commands.len(), 50);
        assert_eq!(commands[49].id, "users/50");
    }
}
