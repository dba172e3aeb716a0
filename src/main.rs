use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use orderflow_engine::journal::spawn_journal;
use orderflow_engine::persistence::FileStore;
use orderflow_engine::{Dispatcher, EngineConfig, EngineEvent, FeedMessage};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON engine config (defaults are used when omitted)
    #[arg(short, long, env = "ORDERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the trade store and footprint log
    #[arg(short, long, env = "ORDERFLOW_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// JSONL feed file; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Override the configured worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Append trade lifecycle rows to this CSV
    #[arg(short, long)]
    journal: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orderflow_engine=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.dispatch.workers = workers;
        config.validate()?;
    }

    info!("Starting order-flow engine");
    info!("Data dir: {}", args.data_dir.display());
    info!("Workers: {}", config.dispatch.workers);

    let store = Arc::new(FileStore::open(&args.data_dir)?);

    let (events, journal) = match &args.journal {
        Some(path) => {
            let (tx, rx) = broadcast::channel::<EngineEvent>(1024);
            info!("Journal: {}", path.display());
            (Some(tx), Some(spawn_journal(path.clone(), rx)))
        }
        None => (None, None),
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    let dispatcher = Dispatcher::start(config, store, events, now_ms).await?;

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open feed {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    let mut lines = BufReader::new(reader).lines();
    let mut line_no = 0u64;
    let mut messages = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match FeedMessage::parse_line(&line) {
            Ok(batch) => {
                for message in batch {
                    dispatcher.send(message).await?;
                    messages += 1;
                }
            }
            Err(e) => warn!("Skipping line {}: {}", line_no, e),
        }
    }
    info!("Feed exhausted: {} lines, {} messages", line_no, messages);

    let reports = dispatcher.shutdown().await?;
    let pending: usize = reports.iter().map(|r| r.pending_writes).sum();
    let open: usize = reports.iter().map(|r| r.open_trades).sum();
    let closed: usize = reports.iter().map(|r| r.closed_trades).sum();
    info!("Shutdown complete | {} open | {} closed | {} pending writes", open, closed, pending);
    if pending > 0 {
        warn!("{} trade writes were not persisted", pending);
    }

    if let Some(handle) = journal {
        let rows = handle.await.context("Journal task panicked")??;
        info!("Journal wrote {} rows", rows);
    }

    Ok(())
}
