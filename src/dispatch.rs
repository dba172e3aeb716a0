//! Ordered per-symbol dispatch
//!
//! Feed producers push into one bounded ingress channel. A router task pins
//! each symbol to a worker by hash and forwards into that worker's bounded
//! queue, so a symbol's messages are applied in arrival order while
//! different symbols run in parallel. Each worker owns a `DecisionEngine`
//! on a blocking thread; the store is the only shared resource.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::events::EngineEvent;
use crate::feed::FeedMessage;
use crate::persistence::TradeStore;
use crate::trading_core::DecisionEngine;

/// Worker index a symbol is pinned to
pub fn worker_for(symbol: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// Per-worker summary returned at shutdown
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub worker: usize,
    pub processed: u64,
    pub actions: u64,
    pub open_trades: usize,
    pub closed_trades: usize,
    /// Trade writes still unpersisted after the shutdown flush
    pub pending_writes: usize,
}

pub struct Dispatcher {
    ingress: mpsc::Sender<FeedMessage>,
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<WorkerReport>>,
}

impl Dispatcher {
    /// Build and rehydrate one engine per worker, then start routing.
    /// Rehydration finishes before any worker sees a live message.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn TradeStore>,
        events: Option<broadcast::Sender<EngineEvent>>,
        now_ms: i64,
    ) -> Result<Self> {
        let count = config.dispatch.workers.max(1);
        let capacity = config.dispatch.queue_capacity.max(1);

        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for idx in 0..count {
            let config = config.clone();
            let store = Arc::clone(&store);
            let events = events.clone();
            let engine = tokio::task::spawn_blocking(move || {
                let mut engine = DecisionEngine::new(config, store, events);
                let restored = engine.rehydrate_where(now_ms, |symbol| worker_for(symbol, count) == idx)?;
                Ok::<_, crate::error::EngineError>((engine, restored))
            })
            .await
            .context("Rehydration task panicked")?;
            let (engine, restored) = engine.with_context(|| format!("Worker {} rehydration failed", idx))?;
            info!("Worker {} ready ({} open trades restored)", idx, restored);

            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            workers.push(tokio::task::spawn_blocking(move || run_worker(idx, engine, rx)));
        }

        let (ingress, mut ingress_rx) = mpsc::channel::<FeedMessage>(capacity);
        let router = tokio::spawn(async move {
            while let Some(message) = ingress_rx.recv().await {
                let idx = worker_for(message.symbol(), senders.len());
                if senders[idx].send(message).await.is_err() {
                    warn!("Worker {} stopped; dropping message", idx);
                }
            }
        });

        Ok(Self { ingress, router, workers })
    }

    /// Handle for producers; usable from any thread via `blocking_send`
    pub fn sender(&self) -> mpsc::Sender<FeedMessage> {
        self.ingress.clone()
    }

    pub async fn send(&self, message: FeedMessage) -> Result<()> {
        self.ingress
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("Dispatcher router stopped"))
    }

    /// Close ingress, drain every queue, flush each engine and collect the
    /// reports. Waits for outstanding `sender()` clones to drop.
    pub async fn shutdown(self) -> Result<Vec<WorkerReport>> {
        let Self { ingress, router, workers } = self;
        drop(ingress);
        router.await.context("Router task panicked")?;

        let mut reports = Vec::with_capacity(workers.len());
        for result in join_all(workers).await {
            reports.push(result.context("Worker task panicked")?);
        }
        Ok(reports)
    }
}

fn run_worker(idx: usize, mut engine: DecisionEngine, mut rx: mpsc::Receiver<FeedMessage>) -> WorkerReport {
    let mut report = WorkerReport {
        worker: idx,
        ..Default::default()
    };
    let mut last_ts = None;

    while let Some(message) = rx.blocking_recv() {
        report.processed += 1;
        last_ts = Some(last_ts.map_or(message.ts_ms(), |t: i64| t.max(message.ts_ms())));
        if engine.on_message(message).is_some() {
            report.actions += 1;
        }
    }

    let flush_ts = last_ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    report.pending_writes = engine.flush(flush_ts);
    report.open_trades = engine.open_trades().count();
    report.closed_trades = engine.closed_trades().len();
    info!(
        "Worker {} stopped | {} messages | {} actions | {} open | {} pending writes",
        idx, report.processed, report.actions, report.open_trades, report.pending_writes
    );
    report
}
