//! Record envelope carried in each frame payload.
//!
//! Every stored record travels as one PUT command:
//!
//! ```json
//! {"Type":"PUT","Id":"users/1","Document":{"name":"ada","@metadata":{...}}}
//! ```
//!
//! The frame codec and parser never look inside the payload; this module is
//! the default `RecordEncoder` plus the id rules that apply before any I/O.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IngestError, Result};

/// Reserved suffix for server-assigned id continuations
pub const ID_CONTINUATION_MARKER: char = '|';

pub const METADATA_KEY: &str = "@metadata";
pub const METADATA_ID_KEY: &str = "@id";
pub const PUT_COMMAND_TYPE: &str = "PUT";

/// Per-record metadata attached under `@metadata`.
pub type Metadata = serde_json::Map<String, Value>;

/// Reject ids the server cannot accept. Runs before any network call.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(IngestError::Validation(
            "document id must have a non empty value".into(),
        ));
    }
    if id.ends_with(ID_CONTINUATION_MARKER) {
        return Err(IngestError::Validation(format!(
            "document ids cannot end with '{}', but was called with {}",
            ID_CONTINUATION_MARKER, id
        )));
    }
    Ok(())
}

/// Turns a record into the opaque frame payload.
pub trait RecordEncoder: Send + Sync {
    fn encode(&self, id: &str, record: Value, metadata: Option<&Metadata>) -> Result<Vec<u8>>;
}

#[derive(Serialize)]
struct PutCommand<'a> {
    #[serde(rename = "Type")]
    kind: &'static str,
    #[serde(rename = "Id")]
    id: &'a str,
    #[serde(rename = "Document")]
    document: Value,
}

/// Default encoder: JSON PUT command.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutCommandEncoder;

impl RecordEncoder for PutCommandEncoder {
    fn encode(&self, id: &str, record: Value, metadata: Option<&Metadata>) -> Result<Vec<u8>> {
        let mut document = record;
        if let Some(metadata) = metadata {
            let Value::Object(fields) = &mut document else {
                return Err(IngestError::Validation(format!(
                    "record {} must serialize to a JSON object to carry metadata",
                    id
                )));
            };
            fields.insert(METADATA_KEY.to_string(), Value::Object(metadata.clone()));
        }

        let command = PutCommand {
            kind: PUT_COMMAND_TYPE,
            id,
            document,
        };
        Ok(serde_json::to_vec(&command)?)
    }
}

/// A PUT command read back from a frame payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecodedCommand {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Document")]
    pub document: Value,
}

impl DecodedCommand {
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.document.get(METADATA_KEY).and_then(Value::as_object)
    }
}

// =============================================================================
// Client-side id generation
// =============================================================================

/// Sequential ids of the form `<prefix>/<n>`, starting at 1.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}/{}", self.prefix, n)
    }

    /// Id from the `@id` metadata entry, or a freshly generated one.
    pub fn resolve(&self, metadata: Option<&Metadata>) -> String {
        metadata
            .and_then(|m| m.get(METADATA_ID_KEY))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.next_id())
    }
}
