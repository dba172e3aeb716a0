//! CSV trade journal
//!
//! Subscribes to engine events and appends one row per entry, stop update,
//! add-on and exit. Footprint and persistence events are not journaled.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::events::EngineEvent;

#[derive(Debug, Serialize)]
struct JournalRow {
    ts_ms: i64,
    event: &'static str,
    symbol: String,
    trade_id: String,
    side: Option<String>,
    price: Option<f64>,
    stop: Option<f64>,
    target: Option<f64>,
    reason: Option<String>,
    pnl: Option<f64>,
}

impl JournalRow {
    fn from_event(event: &EngineEvent) -> Option<Self> {
        let row = match event {
            EngineEvent::TradeOpened(t) => JournalRow {
                ts_ms: t.entry_ts,
                event: "ENTRY",
                symbol: t.symbol.clone(),
                trade_id: t.id.to_string(),
                side: Some(t.side.to_string()),
                price: Some(t.entry_price),
                stop: Some(t.stop_price),
                target: Some(t.take_profit_price),
                reason: None,
                pnl: None,
            },
            EngineEvent::TradeClosed(t) => JournalRow {
                ts_ms: t.exit_ts.unwrap_or(t.entry_ts),
                event: "EXIT",
                symbol: t.symbol.clone(),
                trade_id: t.id.to_string(),
                side: Some(t.side.to_string()),
                price: t.exit_price,
                stop: Some(t.stop_price),
                target: Some(t.take_profit_price),
                reason: t.reason.map(|r| r.to_string()),
                pnl: t.pnl,
            },
            EngineEvent::StopUpdated { symbol, trade_id, stop, ts_ms } => JournalRow {
                ts_ms: *ts_ms,
                event: "STOP",
                symbol: symbol.clone(),
                trade_id: trade_id.to_string(),
                side: None,
                price: None,
                stop: Some(*stop),
                target: None,
                reason: None,
                pnl: None,
            },
            EngineEvent::AddOn { symbol, trade_id, price, count, ts_ms } => JournalRow {
                ts_ms: *ts_ms,
                event: "ADD",
                symbol: symbol.clone(),
                trade_id: trade_id.to_string(),
                side: None,
                price: Some(*price),
                stop: None,
                target: None,
                reason: Some(format!("add #{}", count)),
                pnl: None,
            },
            EngineEvent::FootprintClosed(_) | EngineEvent::PersistenceDegraded { .. } => return None,
        };
        Some(row)
    }
}

pub struct TradeJournal {
    path: PathBuf,
    writer: csv::Writer<std::fs::File>,
}

impl TradeJournal {
    /// Append to `path`, writing the header only when the file is new or empty
    pub fn create(path: &Path) -> Result<Self> {
        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        let writer = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// Returns true if the event produced a row
    pub fn record(&mut self, event: &EngineEvent) -> Result<bool> {
        let Some(row) = JournalRow::from_event(event) else {
            return Ok(false);
        };
        self.writer
            .serialize(row)
            .with_context(|| format!("Failed to write journal row to {}", self.path.display()))?;
        self.writer.flush()?;
        Ok(true)
    }
}

/// Journal events until every sender is dropped. Returns the rows written.
pub fn spawn_journal(path: PathBuf, mut rx: broadcast::Receiver<EngineEvent>) -> JoinHandle<Result<u64>> {
    tokio::task::spawn_blocking(move || {
        let mut journal = TradeJournal::create(&path)?;
        let mut rows = 0u64;
        loop {
            match rx.blocking_recv() {
                Ok(event) => {
                    if journal.record(&event)? {
                        rows += 1;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Journal lagged, {} events missed", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Journal {} closed ({} rows)", path.display(), rows);
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::trades::{EntryKind, ExitReason, Trade};
    use crate::types::Side;

    #[tokio::test]
    async fn test_journal_writes_trade_lifecycle_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        let (tx, rx) = broadcast::channel(16);
        let handle = spawn_journal(path.clone(), rx);

        let mut trade = Trade::open("NIFTY", Side::Short, 100.0, 1_000, 101.0, 97.0, EntryKind::Standard);
        tx.send(EngineEvent::TradeOpened(trade.clone())).unwrap();
        tx.send(EngineEvent::StopUpdated { symbol: "NIFTY".into(), trade_id: trade.id, stop: 100.5, ts_ms: 2_000 })
            .unwrap();
        tx.send(EngineEvent::PersistenceDegraded { symbol: "NIFTY".into(), pending: 1 }).unwrap();
        trade.close(97.0, 3_000, ExitReason::TakeProfit);
        tx.send(EngineEvent::TradeClosed(trade)).unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 3);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[1], "event");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][1], "ENTRY");
        assert_eq!(&rows[0][4], "SHORT");
        assert_eq!(&rows[2][1], "EXIT");
        assert_eq!(&rows[2][8], "TP");
        assert_eq!(&rows[2][9], "3.0");
    }

    #[test]
    fn test_reopened_journal_appends_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        let trade = Trade::open("X", Side::Long, 10.0, 1, 9.5, 11.5, EntryKind::Igniting);

        TradeJournal::create(&path).unwrap().record(&EngineEvent::TradeOpened(trade.clone())).unwrap();
        TradeJournal::create(&path).unwrap().record(&EngineEvent::TradeOpened(trade)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().filter(|l| l.starts_with("ts_ms")).count(), 1);
        assert_eq!(content.lines().count(), 3);
    }
}
