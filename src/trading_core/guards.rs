//! Entry guards
//!
//! All state is keyed by symbol (and side where it matters) and fed from
//! the single exit transition in the engine.

use std::collections::{HashMap, VecDeque};

use super::trades::Trade;
use crate::config::GuardConfig;
use crate::types::Side;

/// Rolling win/loss outcomes per (symbol, side)
pub struct DirectionalBiasGuard {
    window: usize,
    min_trades: usize,
    loss_threshold: f64,
    history: HashMap<(String, Side), VecDeque<bool>>,
}

impl DirectionalBiasGuard {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            window: config.bias_window.max(1),
            min_trades: config.bias_min_trades,
            loss_threshold: config.bias_loss_threshold,
            history: HashMap::new(),
        }
    }

    pub fn record_exit(&mut self, trade: &Trade) {
        let win = trade.pnl.is_some_and(|p| p > 0.0);
        let records = self.history.entry((trade.symbol.clone(), trade.side)).or_default();
        records.push_back(win);
        while records.len() > self.window {
            records.pop_front();
        }
    }

    pub fn loss_ratio(&self, symbol: &str, side: Side) -> Option<f64> {
        let records = self.history.get(&(symbol.to_string(), side))?;
        if records.is_empty() {
            return None;
        }
        let losses = records.iter().filter(|w| !**w).count();
        Some(losses as f64 / records.len() as f64)
    }

    /// Too few outcomes always allows
    pub fn allow_trade(&self, symbol: &str, side: Side) -> bool {
        let samples = self
            .history
            .get(&(symbol.to_string(), side))
            .map(|r| r.len())
            .unwrap_or(0);
        if samples < self.min_trades {
            return true;
        }
        self.loss_ratio(symbol, side).map_or(true, |r| r < self.loss_threshold)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LossRun {
    count: u32,
    last_loss_ts: Option<i64>,
}

/// Blocks a side after consecutive losses until enough 1-minute candles pass
pub struct ConsecutiveLossGuard {
    max_losses: u32,
    cooldown_candles: i64,
    runs: HashMap<(String, Side), LossRun>,
}

impl ConsecutiveLossGuard {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            max_losses: config.max_consecutive_losses,
            cooldown_candles: config.loss_cooldown_candles,
            runs: HashMap::new(),
        }
    }

    pub fn record_exit(&mut self, trade: &Trade) {
        let run = self.runs.entry((trade.symbol.clone(), trade.side)).or_default();
        match trade.pnl {
            Some(p) if p < 0.0 => {
                run.count += 1;
                run.last_loss_ts = trade.exit_ts;
            }
            _ => run.count = 0,
        }
    }

    pub fn allow_trade(&self, symbol: &str, side: Side, candle_ts: i64) -> bool {
        let Some(run) = self.runs.get(&(symbol.to_string(), side)) else {
            return true;
        };
        if run.count < self.max_losses {
            return true;
        }
        match run.last_loss_ts {
            Some(last) => (candle_ts - last).div_euclid(60_000) >= self.cooldown_candles,
            None => true,
        }
    }
}

/// Per-symbol quiet period after a stop-type exit
pub struct CooldownManager {
    cooldown_ms: i64,
    last_stop: HashMap<String, i64>,
}

impl CooldownManager {
    pub fn new(cooldown_ms: i64) -> Self {
        Self {
            cooldown_ms,
            last_stop: HashMap::new(),
        }
    }

    pub fn record_stop(&mut self, symbol: &str, ts: i64) {
        self.last_stop.insert(symbol.to_string(), ts);
    }

    pub fn in_cooldown(&self, symbol: &str, ts: i64) -> bool {
        self.last_stop
            .get(symbol)
            .is_some_and(|last| ts - last < self.cooldown_ms)
    }
}

/// Pyramiding permission while a trade runs in profit
pub struct AddOnTracker {
    max_adds: u32,
    threshold_pct: f64,
    counts: HashMap<String, u32>,
}

impl AddOnTracker {
    pub fn new(config: &GuardConfig) -> Self {
        Self {
            max_adds: config.max_adds,
            threshold_pct: config.add_threshold_pct,
            counts: HashMap::new(),
        }
    }

    pub fn can_add(&self, trade: &Trade, close: f64) -> bool {
        if self.count(&trade.symbol) >= self.max_adds {
            return false;
        }
        trade.pnl_pct_at(close) >= self.threshold_pct
    }

    pub fn register_add(&mut self, symbol: &str) {
        *self.counts.entry(symbol.to_string()).or_default() += 1;
    }

    pub fn count(&self, symbol: &str) -> u32 {
        self.counts.get(symbol).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, symbol: &str) {
        self.counts.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::trades::{EntryKind, ExitReason};

    fn closed(side: Side, pnl: f64, exit_ts: i64) -> Trade {
        let mut t = Trade::open("X", side, 100.0, 0, 99.0, 103.0, EntryKind::Standard);
        t.close(100.0 + side.sign() * pnl, exit_ts, ExitReason::StopLoss);
        t
    }

    #[test]
    fn test_two_long_losses_block_long_only() {
        let config = GuardConfig::default();
        let mut guard = ConsecutiveLossGuard::new(&config);
        guard.record_exit(&closed(Side::Long, -1.0, 60_000));
        assert!(guard.allow_trade("X", Side::Long, 120_000));
        guard.record_exit(&closed(Side::Long, -1.0, 120_000));

        assert!(!guard.allow_trade("X", Side::Long, 180_000));
        assert!(!guard.allow_trade("X", Side::Long, 120_000 + 4 * 60_000));
        assert!(guard.allow_trade("X", Side::Short, 180_000));
        assert!(guard.allow_trade("X", Side::Long, 120_000 + 5 * 60_000));
    }

    #[test]
    fn test_win_resets_loss_run() {
        let config = GuardConfig::default();
        let mut guard = ConsecutiveLossGuard::new(&config);
        guard.record_exit(&closed(Side::Short, -1.0, 0));
        guard.record_exit(&closed(Side::Short, -1.0, 0));
        guard.record_exit(&closed(Side::Short, 0.0, 0));
        assert!(guard.allow_trade("X", Side::Short, 0));
    }

    #[test]
    fn test_directional_bias_guard_ratio() {
        let config = GuardConfig::default();
        let mut guard = DirectionalBiasGuard::new(&config);
        for _ in 0..4 {
            guard.record_exit(&closed(Side::Long, -1.0, 0));
        }
        // Below the minimum sample
        assert!(guard.allow_trade("X", Side::Long));

        guard.record_exit(&closed(Side::Long, 2.0, 0));
        // 4/5 = 0.8 losses
        assert!(!guard.allow_trade("X", Side::Long));
        assert!(guard.allow_trade("X", Side::Short));

        for _ in 0..5 {
            guard.record_exit(&closed(Side::Long, 2.0, 0));
        }
        // 4/10 = 0.4
        assert!(guard.allow_trade("X", Side::Long));
    }

    #[test]
    fn test_cooldown_window() {
        let mut cd = CooldownManager::new(180_000);
        assert!(!cd.in_cooldown("X", 0));
        cd.record_stop("X", 1_000);
        assert!(cd.in_cooldown("X", 180_999));
        assert!(!cd.in_cooldown("X", 181_000));
    }

    #[test]
    fn test_add_on_limits() {
        let config = GuardConfig::default();
        let mut adds = AddOnTracker::new(&config);
        let trade = Trade::open("X", Side::Long, 100.0, 0, 99.0, 103.0, EntryKind::Standard);
        assert!(!adds.can_add(&trade, 100.2));
        assert!(adds.can_add(&trade, 100.35));
        adds.register_add("X");
        adds.register_add("X");
        assert!(!adds.can_add(&trade, 101.0));
        adds.reset("X");
        assert!(adds.can_add(&trade, 101.0));
    }
}
