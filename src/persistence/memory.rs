//! In-memory store, also the state model shared with `FileStore`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{StoreError, StoreResult, TradeStore};
use crate::trading_core::footprint::FootprintBar;
use crate::trading_core::trades::{ExitReason, StructureLevel, Trade, TradeStatus};
use crate::types::Ohlcv;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ContextCandle {
    pub symbol: String,
    pub timeframe: u32,
    pub candle: Ohlcv,
}

/// Everything a store persists, in upsert-friendly form
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub trades: Vec<Trade>,
    pub watermarks: HashMap<String, i64>,
    pub levels: Vec<StructureLevel>,
    pub context: Vec<ContextCandle>,
    #[serde(skip)]
    pub footprints: Vec<FootprintBar>,
}

impl StoreState {
    pub fn save_open_trade(&mut self, trade: &Trade) {
        match self.trades.iter_mut().find(|t| t.id == trade.id) {
            Some(existing) => *existing = trade.clone(),
            None => self.trades.push(trade.clone()),
        }
    }

    pub fn close_trade(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_ts: i64,
        reason: ExitReason,
        pnl: f64,
    ) -> StoreResult<()> {
        let open = self
            .trades
            .iter_mut()
            .filter(|t| t.symbol == symbol && t.status == TradeStatus::Open)
            .max_by_key(|t| t.entry_ts);

        match open {
            Some(trade) => {
                trade.exit_price = Some(exit_price);
                trade.exit_ts = Some(exit_ts);
                trade.reason = Some(reason);
                trade.pnl = Some(pnl);
                trade.status = TradeStatus::Closed;
                Ok(())
            }
            None => {
                // Replayed close of a trade that already closed
                let already = self
                    .trades
                    .iter()
                    .any(|t| t.symbol == symbol && t.exit_ts == Some(exit_ts));
                if already {
                    Ok(())
                } else {
                    Err(StoreError::NoOpenTrade(symbol.to_string()))
                }
            }
        }
    }

    pub fn trades_with(&self, status: TradeStatus) -> Vec<Trade> {
        self.trades.iter().filter(|t| t.status == status).cloned().collect()
    }

    pub fn update_last_candle_ts(&mut self, symbol: &str, ts: i64) {
        let mark = self.watermarks.entry(symbol.to_string()).or_insert(ts);
        *mark = (*mark).max(ts);
    }

    pub fn upsert_level(&mut self, level: &StructureLevel) {
        let existing = self
            .levels
            .iter_mut()
            .find(|l| l.symbol == level.symbol && l.side == level.side && l.price == level.price);
        match existing {
            Some(l) => {
                l.created_ts = l.created_ts.min(level.created_ts);
                l.last_used_ts = l.last_used_ts.max(level.last_used_ts);
            }
            None => self.levels.push(level.clone()),
        }
    }

    pub fn save_context_candle(&mut self, symbol: &str, timeframe: u32, candle: &Ohlcv) {
        let existing = self
            .context
            .iter_mut()
            .find(|c| c.symbol == symbol && c.timeframe == timeframe && c.candle.ts_ms == candle.ts_ms);
        match existing {
            Some(c) => c.candle = *candle,
            None => self.context.push(ContextCandle {
                symbol: symbol.to_string(),
                timeframe,
                candle: *candle,
            }),
        }
    }

    pub fn load_context_candles(&self, symbol: &str, timeframe: u32, limit: usize) -> Vec<Ohlcv> {
        let mut candles: Vec<Ohlcv> = self
            .context
            .iter()
            .filter(|c| c.symbol == symbol && c.timeframe == timeframe)
            .map(|c| c.candle)
            .collect();
        candles.sort_by_key(|c| c.ts_ms);
        let skip = candles.len().saturating_sub(limit);
        candles.split_off(skip)
    }

    pub fn save_footprint(&mut self, bar: &FootprintBar) {
        match self
            .footprints
            .iter_mut()
            .find(|b| b.symbol == bar.symbol && b.ts_ms == bar.ts_ms)
        {
            Some(existing) => *existing = bar.clone(),
            None => self.footprints.push(bar.clone()),
        }
    }
}

/// Process-local store. `set_unavailable` simulates an outage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn footprints(&self) -> Vec<FootprintBar> {
        self.state.lock().map(|s| s.footprints.clone()).unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> StoreResult<T>) -> StoreResult<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        f(&mut state)
    }
}

impl TradeStore for MemoryStore {
    fn save_open_trade(&self, trade: &Trade) -> StoreResult<()> {
        self.with_state(|s| {
            s.save_open_trade(trade);
            Ok(())
        })
    }

    fn close_trade(
        &self,
        symbol: &str,
        exit_price: f64,
        exit_ts: i64,
        reason: ExitReason,
        pnl: f64,
    ) -> StoreResult<()> {
        self.with_state(|s| s.close_trade(symbol, exit_price, exit_ts, reason, pnl))
    }

    fn load_open_trades(&self) -> StoreResult<Vec<Trade>> {
        self.with_state(|s| Ok(s.trades_with(TradeStatus::Open)))
    }

    fn load_closed_trades(&self) -> StoreResult<Vec<Trade>> {
        self.with_state(|s| Ok(s.trades_with(TradeStatus::Closed)))
    }

    fn get_last_candle_ts(&self, symbol: &str) -> StoreResult<Option<i64>> {
        self.with_state(|s| Ok(s.watermarks.get(symbol).copied()))
    }

    fn update_last_candle_ts(&self, symbol: &str, ts: i64) -> StoreResult<()> {
        self.with_state(|s| {
            s.update_last_candle_ts(symbol, ts);
            Ok(())
        })
    }

    fn upsert_level(&self, level: &StructureLevel) -> StoreResult<()> {
        self.with_state(|s| {
            s.upsert_level(level);
            Ok(())
        })
    }

    fn load_levels_for_all(&self) -> StoreResult<Vec<StructureLevel>> {
        self.with_state(|s| Ok(s.levels.clone()))
    }

    fn save_footprint(&self, _symbol: &str, bar: &FootprintBar) -> StoreResult<()> {
        self.with_state(|s| {
            s.save_footprint(bar);
            Ok(())
        })
    }

    fn save_context_candle(&self, symbol: &str, timeframe: u32, candle: &Ohlcv) -> StoreResult<()> {
        self.with_state(|s| {
            s.save_context_candle(symbol, timeframe, candle);
            Ok(())
        })
    }

    fn load_context_candles(&self, symbol: &str, timeframe: u32, limit: usize) -> StoreResult<Vec<Ohlcv>> {
        self.with_state(|s| Ok(s.load_context_candles(symbol, timeframe, limit)))
    }
}
