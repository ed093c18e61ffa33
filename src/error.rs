//! Error types for bulk-ingest operations.
//!
//! A single crate-wide enum covers the whole producer/consumer path. Dispose
//! reconciles up to three independent failure sources (local flush, background
//! send task, remote-reported error), so `Aborted` and `Aggregate` carry every
//! cause that was observed instead of keeping only the first one.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::streaming::protocol::FrameError;

/// Errors produced by bulk-ingest operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Caller supplied an empty id or one ending in the continuation marker.
    #[error("invalid document id: {0}")]
    Validation(String),

    /// A one-shot handshake signal was set twice, or the operation was used
    /// after it already failed.
    #[error("bulk ingest protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote operation was cancelled, or a kill could not be confirmed.
    ///
    /// `causes` holds local failures that were observed alongside the remote
    /// reason (empty when the remote reason is the only failure).
    #[error("bulk ingest aborted: {reason}")]
    Aborted {
        reason: String,
        causes: Vec<IngestError>,
    },

    /// The outbound byte sink could not be opened or failed mid-write.
    #[error("ingest stream unavailable: {message}")]
    StreamUnavailable {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Two or more independent failures observed while disposing.
    #[error(transparent)]
    Aggregate(AggregateFailure),

    /// The cancellation token fired at a suspension point.
    #[error("bulk ingest operation cancelled")]
    Cancelled,

    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A control call to the remote side failed.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The background send task panicked, was aborted or timed out.
    #[error("background send task failed: {message}")]
    BackgroundTask { message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IngestError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
            causes: Vec::new(),
        }
    }

    pub fn stream_unavailable(message: impl Into<String>) -> Self {
        Self::StreamUnavailable {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Remote abort reason, if this error (or its first aggregated cause)
    /// carries one.
    pub fn abort_reason(&self) -> Option<&str> {
        match self {
            Self::Aborted { reason, .. } => Some(reason),
            Self::Aggregate(agg) => agg.causes().first().and_then(|e| e.abort_reason()),
            _ => None,
        }
    }
}

/// Failures collected during dispose, in a fixed order: local flush failure
/// first, then the background send task failure.
#[derive(Debug)]
pub struct AggregateFailure {
    causes: Vec<IngestError>,
}

impl AggregateFailure {
    pub fn new(causes: Vec<IngestError>) -> Self {
        Self { causes }
    }

    pub fn causes(&self) -> &[IngestError] {
        &self.causes
    }

    pub fn into_causes(self) -> Vec<IngestError> {
        self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bulk ingest failed with {} error(s)", self.causes.len())?;
        for (i, cause) in self.causes.iter().enumerate() {
            write!(f, "; [{}] {}", i, cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type for bulk-ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IngestError::Validation("id is empty".into());
        assert!(err.to_string().contains("id is empty"));

        let err = IngestError::aborted("killed by admin");
        assert!(err.to_string().contains("killed by admin"));
        assert!(err.is_aborted());

        let err = IngestError::stream_unavailable("connection reset");
        assert!(err.to_string().contains("connection reset"));

        let err = IngestError::Cancelled;
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_aggregate_lists_every_cause() {
        let agg = AggregateFailure::new(vec![
            IngestError::stream_unavailable("flush failed"),
            IngestError::BackgroundTask {
                message: "task panicked".into(),
            },
        ]);
        let text = agg.to_string();

        assert!(text.contains("2 error(s)"));
        assert!(text.contains("[0] ingest stream unavailable: flush failed"));
        assert!(text.contains("[1] background send task failed: task panicked"));
    }

    #[test]
    fn test_abort_reason_looks_through_aggregate() {
        let err = IngestError::Aggregate(AggregateFailure::new(vec![
            IngestError::aborted("disk full"),
            IngestError::Cancelled,
        ]));
        assert_eq!(err.abort_reason(), Some("disk full"));

        assert_eq!(IngestError::Cancelled.abort_reason(), None);
    }

    #[test]
    fn test_aggregate_into_causes_keeps_order() {
        let agg = AggregateFailure::new(vec![
            IngestError::stream_unavailable("flush failed"),
            IngestError::transport("request rejected"),
        ]);
        assert!(!agg.is_empty());

        let causes = agg.into_causes();
        assert!(matches!(causes[0], IngestError::StreamUnavailable { .. }));
        assert!(matches!(causes[1], IngestError::Transport { .. }));
    }
}
