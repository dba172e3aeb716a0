//! Persistence gateway
//!
//! The engine only depends on the `TradeStore` contract. Every write is an
//! idempotent upsert keyed by symbol+timestamp or symbol+price+side, so any
//! call may be retried.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::trading_core::footprint::FootprintBar;
use crate::trading_core::trades::{ExitReason, StructureLevel, Trade};
use crate::types::Ohlcv;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no open trade for {0}")]
    NoOpenTrade(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable trade state, structure levels and watermarks
pub trait TradeStore: Send + Sync {
    /// Upsert keyed by trade id
    fn save_open_trade(&self, trade: &Trade) -> StoreResult<()>;

    /// Close the symbol's open trade. Closing an already-closed trade with the
    /// same exit timestamp is a no-op.
    fn close_trade(
        &self,
        symbol: &str,
        exit_price: f64,
        exit_ts: i64,
        reason: ExitReason,
        pnl: f64,
    ) -> StoreResult<()>;

    fn load_open_trades(&self) -> StoreResult<Vec<Trade>>;

    fn load_closed_trades(&self) -> StoreResult<Vec<Trade>>;

    fn get_last_candle_ts(&self, symbol: &str) -> StoreResult<Option<i64>>;

    fn update_last_candle_ts(&self, symbol: &str, ts: i64) -> StoreResult<()>;

    /// Upsert keyed by (symbol, price, side)
    fn upsert_level(&self, level: &StructureLevel) -> StoreResult<()>;

    fn load_levels_for_all(&self) -> StoreResult<Vec<StructureLevel>>;

    /// Upsert keyed by (symbol, bar start)
    fn save_footprint(&self, symbol: &str, bar: &FootprintBar) -> StoreResult<()>;

    /// Completed higher-timeframe candle, keyed by (symbol, timeframe, ts)
    fn save_context_candle(&self, symbol: &str, timeframe: u32, candle: &Ohlcv) -> StoreResult<()>;

    /// Most recent `limit` context candles, oldest first
    fn load_context_candles(&self, symbol: &str, timeframe: u32, limit: usize) -> StoreResult<Vec<Ohlcv>>;
}

/// Retry a trade-state write with exponential backoff.
///
/// Blocks the calling worker thread between attempts; decision workers run
/// on blocking threads so this never stalls the async runtime.
pub fn retry_with_backoff<T>(
    what: &str,
    max_retries: u32,
    base_ms: u64,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                let delay = base_ms.saturating_mul(1 << attempt.min(16));
                warn!("{} failed (attempt {}): {}, retrying in {}ms", what, attempt + 1, e, delay);
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
