//! Order-Book Analyzer
//!
//! Consumes bounded-depth snapshots for imbalance, absorption and wall
//! checks plus the book-derived dynamic stop.

use std::collections::{HashMap, VecDeque};

use crate::config::OrderBookConfig;
use crate::types::{round_to_tick, BookLevel, BookSnapshot, Side};

pub struct OrderBookAnalyzer {
    config: OrderBookConfig,
    tick_size: f64,
    history: HashMap<String, VecDeque<BookSnapshot>>,
}

impl OrderBookAnalyzer {
    pub fn new(config: OrderBookConfig, tick_size: f64) -> Self {
        Self {
            config,
            tick_size,
            history: HashMap::new(),
        }
    }

    pub fn update(&mut self, snapshot: BookSnapshot) {
        let cap = self.config.history.max(1);
        let snapshot = snapshot.normalized();
        let history = self.history.entry(snapshot.symbol.clone()).or_default();
        history.push_back(snapshot);
        while history.len() > cap {
            history.pop_front();
        }
    }

    pub fn current(&self, symbol: &str) -> Option<&BookSnapshot> {
        self.history.get(symbol).and_then(|h| h.back())
    }

    pub fn best_bid(&self, symbol: &str) -> Option<BookLevel> {
        self.current(symbol).and_then(|b| b.best_bid())
    }

    pub fn best_ask(&self, symbol: &str) -> Option<BookLevel> {
        self.current(symbol).and_then(|b| b.best_ask())
    }

    /// Aggregate buy/sell totals of the latest snapshot
    pub fn totals(&self, symbol: &str) -> Option<(u64, u64)> {
        self.current(symbol).map(|b| (b.total_buy_qty, b.total_sell_qty))
    }

    /// LONG needs total buy >= ratio x total sell; SHORT the mirror.
    /// A book with either total at zero confirms nothing.
    pub fn check_entry_imbalance(&self, symbol: &str, side: Side) -> bool {
        let Some((tbq, tsq)) = self.totals(symbol) else {
            return false;
        };
        if tbq == 0 || tsq == 0 {
            return false;
        }
        let (tbq, tsq) = (tbq as f64, tsq as f64);
        match side {
            Side::Long => tbq >= tsq * self.config.imbalance_ratio,
            Side::Short => tsq >= tbq * self.config.imbalance_ratio,
        }
    }

    /// Best level on the supporting side keeps size while its price holds
    pub fn check_absorption(&self, symbol: &str, side: Side) -> bool {
        let Some(history) = self.history.get(symbol) else {
            return false;
        };
        let k = self.config.absorption_snapshots.max(1);
        if history.len() < k {
            return false;
        }

        let best: Vec<Option<BookLevel>> = history
            .iter()
            .skip(history.len() - k)
            .map(|s| match side {
                Side::Long => s.best_bid(),
                Side::Short => s.best_ask(),
            })
            .collect();

        let avg_qty = best.iter().map(|l| l.map(|l| l.qty as f64).unwrap_or(0.0)).sum::<f64>() / k as f64;
        let Some(first) = best[0].map(|l| l.price) else {
            return false;
        };
        let tol = self.config.absorption_price_tolerance;
        let held = best.iter().all(|l| match (l, side) {
            (Some(l), Side::Long) => l.price >= first * (1.0 - tol),
            (Some(l), Side::Short) => l.price <= first * (1.0 + tol),
            (None, _) => false,
        });

        avg_qty > self.config.absorption_min_qty && held
    }

    /// First level on the side opposing `side` whose size exceeds the
    /// configured multiple of that side's average
    pub fn detect_wall(&self, symbol: &str, side: Side) -> Option<f64> {
        let book = self.current(symbol)?;
        let levels = match side {
            Side::Long => &book.asks,
            Side::Short => &book.bids,
        };
        if levels.is_empty() {
            return None;
        }
        let avg = levels.iter().map(|l| l.qty as f64).sum::<f64>() / levels.len() as f64;
        levels
            .iter()
            .find(|l| l.qty as f64 > avg * self.config.wall_multiple)
            .map(|l| l.price)
    }

    /// Price within the proximity band of an opposing wall
    pub fn near_wall(&self, symbol: &str, side: Side, price: f64) -> Option<f64> {
        let wall = self.detect_wall(symbol, side)?;
        ((price - wall).abs() / price < self.config.wall_proximity_pct).then_some(wall)
    }

    /// The wider of one tick beyond the best quote and one tick beyond the
    /// candle extreme
    pub fn dynamic_stop(&self, symbol: &str, side: Side, candle_low: f64, candle_high: f64) -> f64 {
        let tick = self.tick_size;
        let stop = match side {
            Side::Long => {
                let bid_stop = self.best_bid(symbol).map(|b| b.price - tick).unwrap_or(candle_low);
                bid_stop.min(candle_low - tick)
            }
            Side::Short => {
                let ask_stop = self.best_ask(symbol).map(|a| a.price + tick).unwrap_or(candle_high);
                ask_stop.max(candle_high + tick)
            }
        };
        round_to_tick(stop, tick)
    }
}
