//! One-shot rendezvous between the transport and the operation controller.
//!
//! The transport decides when the outbound body becomes writable (connection
//! established); the producer decides what to write and when it is finished.
//! Two one-shot channels connect those lifetimes:
//!
//! ```text
//!  transport                      bridge                    producer
//!  resolve_sink(sink) ───────▶ [sink slot] ───────▶ await_sink()
//!  fail_before_sink(err) ────▶
//!  await_done()       ◀─────── [done slot] ◀─────── signal_done()
//!                                          ◀─────── fail_after_sink(err)
//! ```
//!
//! Each slot is consumed once. Setting an already-consumed slot is a
//! protocol violation; the `fail_*` methods are best-effort and report
//! whether they were the ones to complete the slot.

use std::sync::{Mutex, PoisonError};

use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::error::{IngestError, Result};

/// Outbound byte sink handed over by the transport.
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

type SinkSlot = oneshot::Sender<Result<BoxedSink>>;
type DoneSlot = oneshot::Sender<Result<()>>;

pub struct HandshakeBridge {
    sink_tx: Mutex<Option<SinkSlot>>,
    sink_rx: Mutex<Option<oneshot::Receiver<Result<BoxedSink>>>>,
    done_tx: Mutex<Option<DoneSlot>>,
    done_rx: Mutex<Option<oneshot::Receiver<Result<()>>>>,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn is_taken<T>(slot: &Mutex<Option<T>>) -> bool {
    slot.lock().unwrap_or_else(PoisonError::into_inner).is_none()
}

impl HandshakeBridge {
    pub fn new() -> Self {
        let (sink_tx, sink_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            sink_tx: Mutex::new(Some(sink_tx)),
            sink_rx: Mutex::new(Some(sink_rx)),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    // =========================================================================
    // Transport side
    // =========================================================================

    /// Hand the opened body sink to the producer. Called once by the
    /// transport when the channel opens.
    pub fn resolve_sink(&self, sink: BoxedSink) -> Result<()> {
        let tx = take(&self.sink_tx).ok_or_else(|| {
            IngestError::protocol_violation("ingest stream sink was already resolved")
        })?;
        tx.send(Ok(sink)).map_err(|_| {
            IngestError::stream_unavailable("producer released the operation before the stream opened")
        })
    }

    /// Fail the producer's pending `await_sink`. Returns `false` when the
    /// sink slot was already completed.
    pub fn fail_before_sink(&self, error: IngestError) -> bool {
        match take(&self.sink_tx) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Wait until the producer has written its last frame.
    ///
    /// Resolves with the producer's error if it called `fail_after_sink`.
    pub async fn await_done(&self) -> Result<()> {
        let rx = take(&self.done_rx).ok_or_else(|| {
            IngestError::protocol_violation("completion of the ingest stream is already awaited")
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(IngestError::stream_unavailable(
                "producer released the operation without signalling completion",
            )),
        }
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Wait for the transport to open the body sink.
    pub async fn await_sink(&self) -> Result<BoxedSink> {
        let rx = take(&self.sink_rx).ok_or_else(|| {
            IngestError::protocol_violation("ingest stream sink is already awaited")
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(IngestError::stream_unavailable(
                "transport closed before the ingest stream opened",
            )),
        }
    }

    /// Tell the transport that no more frames will be written.
    pub fn signal_done(&self) -> Result<()> {
        let tx = take(&self.done_tx).ok_or_else(|| {
            IngestError::protocol_violation("unable to close the stream: completion was already signalled")
        })?;
        // The transport may already be gone; its own error surfaces when the
        // send task is joined.
        let _ = tx.send(Ok(()));
        Ok(())
    }

    /// Fail the transport's pending `await_done`. Returns `false` when the
    /// done slot was already completed.
    pub fn fail_after_sink(&self, error: IngestError) -> bool {
        match take(&self.done_tx) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Whether the sink slot has been completed (resolved or failed).
    pub fn is_sink_settled(&self) -> bool {
        is_taken(&self.sink_tx)
    }

    /// Whether the done slot has been completed (signalled or failed).
    pub fn is_done_settled(&self) -> bool {
        is_taken(&self.done_tx)
    }

    /// Drop every unsettled slot. Parties still waiting observe a closed
    /// channel; later calls see the slots as consumed.
    pub fn close(&self) {
        drop(take(&self.sink_tx));
        drop(take(&self.sink_rx));
        drop(take(&self.done_tx));
        drop(take(&self.done_rx));
    }
}

impl Default for HandshakeBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandshakeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeBridge")
            .field("sink_settled", &self.is_sink_settled())
            .field("done_settled", &self.is_done_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_sink_reaches_producer() {
        let bridge = Arc::new(HandshakeBridge::new());
        let (writer, mut reader) = tokio::io::duplex(64);

        let transport = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                bridge.resolve_sink(Box::new(writer)).unwrap();
                bridge.await_done().await
            })
        };

        let mut sink = bridge.await_sink().await.unwrap();
        sink.write_all(b"hello").await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);
        bridge.signal_done().unwrap();

        transport.await.unwrap().unwrap();
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn test_resolve_twice_is_protocol_violation() {
        let bridge = HandshakeBridge::new();
        let (a, _ra) = tokio::io::duplex(8);
        let (b, _rb) = tokio::io::duplex(8);

        bridge.resolve_sink(Box::new(a)).unwrap();
        let err = bridge.resolve_sink(Box::new(b)).unwrap_err();
        assert!(matches!(err, IngestError::ProtocolViolation(_)));
    }

    #[test]
    fn test_signal_done_twice_is_protocol_violation() {
        let bridge = HandshakeBridge::new();

        bridge.signal_done().unwrap();
        assert!(bridge.is_done_settled());
        let err = bridge.signal_done().unwrap_err();
        assert!(matches!(err, IngestError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_fail_before_sink_reaches_producer() {
        let bridge = HandshakeBridge::new();

        assert!(bridge.fail_before_sink(IngestError::stream_unavailable("refused")));
        assert!(!bridge.fail_before_sink(IngestError::Cancelled));

        match bridge.await_sink().await {
            Err(err) => assert!(err.to_string().contains("refused")),
            Ok(_) => panic!("Expected await_sink to fail"),
        }
    }

    #[tokio::test]
    async fn test_fail_after_sink_reaches_transport() {
        let bridge = HandshakeBridge::new();

        assert!(bridge.fail_after_sink(IngestError::aborted("write failed")));
        let err = bridge.await_done().await.unwrap_err();
        assert_eq!(err.abort_reason(), Some("write failed"));

        // done slot is consumed by the failure
        assert!(bridge.signal_done().is_err());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let bridge = Arc::new(HandshakeBridge::new());

        let waiter = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.await_done().await })
        };
        tokio::task::yield_now().await;
        bridge.close();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, IngestError::StreamUnavailable { .. }));
        assert!(bridge.is_sink_settled());
    }
}
