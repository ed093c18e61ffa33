//! Bulk-ingest configuration.
//!
//! Loaded from TOML or built in code. Every field has a default, so an empty
//! file is a valid configuration:
//!
//! ```toml
//! compression = "gzip"
//! compression_level = 6
//! write_buffer_size = 262144
//! max_frame_size = 67108864
//! request_timeout_secs = 43200
//! id_prefix = "users"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::streaming::command::ID_CONTINUATION_MARKER;
use crate::streaming::compression::{Compression, CompressionKind};
use crate::streaming::protocol::{MAX_FRAME_SIZE, MAX_PAYLOAD_LEN};

/// Buffered writer capacity in front of an uncompressed sink (256KB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound for one bulk-ingest request (12 hours)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 12 * 60 * 60;

pub const DEFAULT_ID_PREFIX: &str = "records";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Whole-stream compression, fixed before the first record is stored
    pub compression: CompressionKind,

    /// Codec level; `None` uses the codec default
    pub compression_level: Option<i32>,

    /// Capacity of the buffered writer used when compression is off
    pub write_buffer_size: usize,

    /// Largest declared frame length a parser accepts
    pub max_frame_size: u32,

    /// Upper bound for the background send task
    pub request_timeout_secs: u64,

    /// Collection prefix for client-generated ids
    pub id_prefix: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            compression: CompressionKind::None,
            compression_level: None,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
        }
    }
}

impl IngestConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| IngestError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_compression(mut self, kind: CompressionKind, level: Option<i32>) -> Self {
        self.compression = kind;
        self.compression_level = level;
        self
    }

    pub fn compression(&self) -> Compression {
        Compression::new(self.compression, self.compression_level)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(IngestError::Config("write_buffer_size must be positive".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size as usize > MAX_PAYLOAD_LEN {
            return Err(IngestError::Config(format!(
                "max_frame_size must be between 1 and {}",
                MAX_PAYLOAD_LEN
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(IngestError::Config("request_timeout_secs must be positive".into()));
        }
        if self.id_prefix.is_empty() || self.id_prefix.ends_with(ID_CONTINUATION_MARKER) {
            return Err(IngestError::Config(format!(
                "id_prefix must be non-empty and must not end with '{}'",
                ID_CONTINUATION_MARKER
            )));
        }
        self.compression().validate()
    }
}
