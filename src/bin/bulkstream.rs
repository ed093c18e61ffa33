//! bulkstream - frame JSON records into a bulk-ingest stream and back
//!
//! # Usage
//!
//! ```bash
//! # Frame JSON lines into a stream file
//! bulkstream encode --input records.jsonl --output stream.bin --compression gzip
//!
//! # Print the records of a stream file, one JSON document per line
//! bulkstream decode --input stream.bin --compression gzip
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bulkstream::streaming::command::{DecodedCommand, Metadata, METADATA_KEY};
use bulkstream::streaming::compression::{decode_body, CompressionKind};
use bulkstream::streaming::parser::{FrameRead, RecordArena, StreamParser};
use bulkstream::streaming::pool::BufferPool;
use bulkstream::{BulkIngestOperation, IngestConfig, LoopbackTransport};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "bulkstream")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Whole-stream compression (overrides the config file)
    #[arg(long, value_enum, global = true)]
    compression: Option<CompressionKind>,

    /// Compression level (overrides the config file)
    #[arg(long, global = true)]
    level: Option<i32>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Frame JSON lines into a bulk-ingest stream
    Encode(EncodeArgs),

    /// Read a bulk-ingest stream back into JSON lines
    Decode(DecodeArgs),
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// JSON lines input (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Stream file to write
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Stream file to read
    #[arg(short, long)]
    input: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => IngestConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => IngestConfig::default(),
    };
    if let Some(kind) = cli.compression {
        let level = cli.level.or(config.compression_level);
        config = config.with_compression(kind, level);
    } else if cli.level.is_some() {
        config.compression_level = cli.level;
    }
    config.validate().context("invalid configuration")?;

    match cli.command {
        Command::Encode(args) => encode(config, args).await,
        Command::Decode(args) => decode(config, &args.input).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();

    Ok(())
}

/// Split `@metadata` off a record so it travels as metadata, not as a field.
fn split_metadata(mut record: Value) -> (Value, Option<Metadata>) {
    let metadata = record
        .as_object_mut()
        .and_then(|fields| fields.remove(METADATA_KEY))
        .and_then(|m| match m {
            Value::Object(m) => Some(m),
            _ => None,
        });
    (record, metadata)
}

async fn encode(config: IngestConfig, args: EncodeArgs) -> Result<()> {
    let transport = Arc::new(LoopbackTransport::new());
    let mut op = BulkIngestOperation::new(transport.clone(), config)?;

    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();

    let mut line_no = 0usize;
    let stored: Result<()> = async {
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line)
                .with_context(|| format!("line {} is not valid JSON", line_no))?;
            let (record, metadata) = split_metadata(record);
            op.store_auto(&record, metadata.as_ref())
                .await
                .with_context(|| format!("failed to store line {}", line_no))?;
        }
        Ok(())
    }
    .await;

    let disposed = op.dispose().await.context("bulk ingest did not complete");
    stored?;
    disposed?;

    let stats = op.stats();
    let body = op
        .operation_id()
        .and_then(|id| transport.take_body(id))
        .map(|b| b.bytes)
        .unwrap_or_default();

    let mut out = tokio::fs::File::create(&args.output)
        .await
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    out.write_all(&body).await?;
    out.flush().await?;

    tracing::info!(
        records = stats.records,
        frame_bytes = stats.frame_bytes,
        written = body.len(),
        output = %args.output.display(),
        "stream written"
    );
    Ok(())
}

async fn decode(config: IngestConfig, input: &Path) -> Result<()> {
    let raw = tokio::fs::read(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let data = decode_body(config.compression, &raw)
        .with_context(|| format!("failed to decompress {} as {:?}", input.display(), config.compression))?;

    let pool = BufferPool::shared();
    let mut parser = StreamParser::new(&data[..], &pool).with_max_frame_size(config.max_frame_size);
    let mut arena = RecordArena::new();
    let mut stdout = tokio::io::stdout();

    loop {
        match parser.next_frame(&mut arena).await? {
            FrameRead::Record(payload) => {
                let command = DecodedCommand::from_slice(&payload)?;
                let mut line = serde_json::to_vec(&command.document)?;
                line.push(b'\n');
                stdout.write_all(&line).await?;
            }
            FrameRead::End => break,
            FrameRead::Truncated { expected, received } => {
                anyhow::bail!(
                    "stream is truncated: frame declared {} bytes, only {} present",
                    expected,
                    received
                );
            }
        }
    }
    stdout.flush().await?;

    let stats = parser.stats();
    tracing::info!(records = stats.records, bytes = stats.payload_bytes, "stream decoded");
    Ok(())
}
