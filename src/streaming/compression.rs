//! Whole-stream compression for the ingest body.
//!
//! Compression wraps the entire frame sequence, not individual frames, so the
//! frame codec writes into a `BodyWriter` without knowing whether the bytes
//! are compressed on their way to the sink. The encoding is announced to the
//! transport out-of-band (`Compression::content_encoding`).

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{IngestError, Result};
use crate::streaming::handshake::BoxedSink;

/// Compressed output is pushed to the sink once this much has accumulated (64KB)
pub const COMPRESSED_FLUSH_THRESHOLD: usize = 64 * 1024;

pub const DEFAULT_GZIP_LEVEL: i32 = 6;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    #[default]
    None,
    Gzip,
    Zstd,
}

/// Codec plus level, fixed for the lifetime of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Compression {
    kind: CompressionKind,
    level: Option<i32>,
}

impl Compression {
    pub const NONE: Compression = Compression {
        kind: CompressionKind::None,
        level: None,
    };

    pub fn new(kind: CompressionKind, level: Option<i32>) -> Self {
        Self { kind, level }
    }

    pub fn gzip() -> Self {
        Self::new(CompressionKind::Gzip, None)
    }

    pub fn zstd() -> Self {
        Self::new(CompressionKind::Zstd, None)
    }

    pub fn kind(&self) -> CompressionKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != CompressionKind::None
    }

    pub fn level(&self) -> i32 {
        match self.kind {
            CompressionKind::None => 0,
            CompressionKind::Gzip => self.level.unwrap_or(DEFAULT_GZIP_LEVEL),
            CompressionKind::Zstd => self.level.unwrap_or(DEFAULT_ZSTD_LEVEL),
        }
    }

    /// Value for the transport's content-encoding header.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self.kind {
            CompressionKind::None => None,
            CompressionKind::Gzip => Some("gzip"),
            CompressionKind::Zstd => Some("zstd"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let level = self.level();
        let valid = match self.kind {
            CompressionKind::None => true,
            CompressionKind::Gzip => (0..=9).contains(&level),
            CompressionKind::Zstd => (1..=22).contains(&level),
        };
        if !valid {
            return Err(IngestError::Config(format!(
                "compression level {} is out of range for {:?}",
                level, self.kind
            )));
        }
        Ok(())
    }
}

// =============================================================================
// BodyWriter: producer -> sink
// =============================================================================

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl Encoder {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.write_all(buf),
            Encoder::Zstd(e) => e.write_all(buf),
        }
    }

    fn try_finish(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.try_finish(),
            Encoder::Zstd(e) => e.do_finish(),
        }
    }

    fn output(&mut self) -> &mut Vec<u8> {
        match self {
            Encoder::Gzip(e) => e.get_mut(),
            Encoder::Zstd(e) => e.get_mut(),
        }
    }
}

enum Inner {
    Plain(BufWriter<BoxedSink>),
    Compressed { encoder: Encoder, sink: BoxedSink },
}

/// Writer side of the ingest body: buffering or compression in front of the
/// transport's sink.
pub struct BodyWriter {
    inner: Inner,
    bytes_in: u64,
}

impl BodyWriter {
    pub fn new(sink: BoxedSink, compression: Compression, buffer_size: usize) -> Result<Self> {
        compression.validate()?;
        let level = compression.level();
        let inner = match compression.kind() {
            CompressionKind::None => Inner::Plain(BufWriter::with_capacity(buffer_size, sink)),
            CompressionKind::Gzip => Inner::Compressed {
                encoder: Encoder::Gzip(GzEncoder::new(
                    Vec::with_capacity(COMPRESSED_FLUSH_THRESHOLD),
                    flate2::Compression::new(level as u32),
                )),
                sink,
            },
            CompressionKind::Zstd => Inner::Compressed {
                encoder: Encoder::Zstd(zstd::stream::write::Encoder::new(
                    Vec::with_capacity(COMPRESSED_FLUSH_THRESHOLD),
                    level,
                )?),
                sink,
            },
        };
        Ok(Self { inner, bytes_in: 0 })
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match &mut self.inner {
            Inner::Plain(w) => w.write_all(buf).await?,
            Inner::Compressed { encoder, sink } => {
                encoder.write_all(buf)?;
                let out = encoder.output();
                if out.len() >= COMPRESSED_FLUSH_THRESHOLD {
                    sink.write_all(out).await?;
                    out.clear();
                }
            }
        }
        self.bytes_in += buf.len() as u64;
        Ok(())
    }

    /// Flush everything buffered, finish the compressed stream and shut the
    /// sink down so the reader observes end of stream.
    pub async fn finish(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Plain(w) => {
                w.flush().await?;
                w.shutdown().await
            }
            Inner::Compressed { encoder, sink } => {
                encoder.try_finish()?;
                let out = encoder.output();
                if !out.is_empty() {
                    sink.write_all(out).await?;
                    out.clear();
                }
                sink.flush().await?;
                sink.shutdown().await
            }
        }
    }

    /// Uncompressed bytes accepted so far
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }
}

// =============================================================================
// Consumer side
// =============================================================================

/// Undo whole-stream compression on a received body.
pub fn decode_body(kind: CompressionKind, data: &[u8]) -> io::Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            let mut out = Vec::with_capacity(data.len() * 4);
            GzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionKind::Zstd => zstd::stream::decode_all(data),
    }
}
