//! s3stream -- stream stdin (or a file) into S3 as a multipart upload.
//!
//! The object is never held in memory as a whole: bytes are buffered up to
//! the configured part size and shipped part by part.  Ctrl+C aborts the
//! upload so no orphaned parts are left behind.

use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncRead;
use tracing::{error, info, warn};

use s3stream::config::{Config, LoggingConfig};
use s3stream::storage::client::{Destination, StorageClient};
use s3stream::ObjectWriter;

/// Command-line arguments for s3stream.
#[derive(Parser, Debug)]
#[command(
    name = "s3stream",
    version,
    about = "Stream bytes into S3-compatible object storage"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Destination bucket (overrides storage.bucket).
    #[arg(short, long)]
    bucket: Option<String>,

    /// Destination object key.
    #[arg(short, long)]
    key: String,

    /// Read from this file instead of stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Override the storage client: aws or memory.
    #[arg(long)]
    backend: Option<String>,

    /// Print Prometheus metrics to stderr on exit.
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => s3stream::config::load_config(path)?,
        None => Config::default(),
    };
    init_logging(&config.logging);
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    }
    if let Some(backend) = cli.backend.clone() {
        config.storage.backend = backend;
    }

    s3stream::metrics::init_metrics()?;
    s3stream::metrics::describe_metrics();

    let bucket = cli
        .bucket
        .clone()
        .or_else(|| config.storage.bucket.clone())
        .ok_or_else(|| anyhow::anyhow!("no bucket given: pass --bucket or set storage.bucket"))?;
    let destination = Destination::new(bucket, cli.key.clone());

    let client = build_client(&config).await?;

    let mut input: Box<dyn AsyncRead + Unpin + Send> = match &cli.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    let mut writer = ObjectWriter::new(client, destination.clone(), &config.upload)?;
    let upload = writer.upload().clone();

    let outcome = tokio::select! {
        result = writer.copy_from(&mut input) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            warn!("Received SIGINT, aborting upload to {}", destination);
            match upload.abort().await {
                Ok(()) => info!("Upload to {} aborted", destination),
                Err(err) => error!("Abort of {} failed: {}", destination, err),
            }
            Err(anyhow::anyhow!("upload to {destination} interrupted"))
        }
    };

    if cli.print_metrics {
        if let Some(rendered) = s3stream::metrics::render_metrics() {
            eprintln!("{rendered}");
        }
    }

    let copied = outcome?;
    match writer.outcome() {
        Some(Ok(done)) => info!(
            "Uploaded {} bytes to {} in {} part(s), etag={}",
            copied,
            done.destination,
            done.parts,
            done.etag.as_deref().unwrap_or("-")
        ),
        _ => info!("Uploaded {} bytes to {}", copied, destination),
    }

    Ok(())
}

/// Build the storage client named by `storage.backend`.
async fn build_client(config: &Config) -> anyhow::Result<Arc<dyn StorageClient>> {
    let client: Arc<dyn StorageClient> = match config.storage.backend.as_str() {
        "aws" => {
            let aws = config.storage.aws.clone().unwrap_or_default();
            let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());
            let client = s3stream::storage::aws::AwsS3Client::new(
                aws.region.clone(),
                non_empty(&aws.endpoint_url),
                aws.use_path_style,
                non_empty(&aws.access_key_id),
                non_empty(&aws.secret_access_key),
            )
            .await?;
            Arc::new(client)
        }
        "memory" => {
            let max = config.storage.memory.max_size_bytes;
            info!("Memory storage client initialized (max_size_bytes={})", max);
            Arc::new(s3stream::storage::memory::MemoryClient::new(max))
        }
        other => anyhow::bail!("unknown storage backend '{other}' (expected aws or memory)"),
    };
    Ok(client)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    // Logs go to stderr; stdout may be part of a pipeline.
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
