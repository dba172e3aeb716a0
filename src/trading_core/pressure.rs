//! Pressure Tracker
//!
//! Rolling window of book total buy/sell quantity readings per symbol.
//! Repeated identical totals are skipped so a quiet book does not dilute
//! the window.

use std::collections::{HashMap, VecDeque};

use crate::config::PressureConfig;
use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    tbq: i64,
    tsq: i64,
}

fn ratio(first: &Reading, last: &Reading) -> f64 {
    let db = last.tbq - first.tbq;
    let ds = last.tsq - first.tsq;
    let total = db.abs() + ds.abs();
    if total == 0 {
        return 0.0;
    }
    (db - ds) as f64 / total as f64
}

pub struct PressureTracker {
    config: PressureConfig,
    history: HashMap<String, VecDeque<Reading>>,
}

impl PressureTracker {
    pub fn new(config: PressureConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    pub fn update(&mut self, symbol: &str, tbq: u64, tsq: u64) {
        let cap = self.config.window.max(2);
        let history = self.history.entry(symbol.to_string()).or_default();
        let (tbq, tsq) = (tbq as i64, tsq as i64);
        if history.back().is_some_and(|r| r.tbq == tbq && r.tsq == tsq) {
            return;
        }
        history.push_back(Reading { tbq, tsq });
        while history.len() > cap {
            history.pop_front();
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.history.get(symbol).map(|h| h.len()).unwrap_or(0)
    }

    /// (Δbuy - Δsell) / (|Δbuy| + |Δsell|) across the window, in [-1, 1]
    pub fn pressure_ratio(&self, symbol: &str) -> f64 {
        match self.history.get(symbol) {
            Some(h) if h.len() >= 2 => match (h.front(), h.back()) {
                (Some(first), Some(last)) => ratio(first, last),
                _ => 0.0,
            },
            _ => 0.0,
        }
    }

    pub fn is_trending(&self, symbol: &str) -> bool {
        self.pressure_ratio(symbol).abs() > self.config.trend_threshold
    }

    /// Pressure still leaning in the position's favour
    pub fn pressure_supports(&self, symbol: &str, side: Side) -> bool {
        let r = self.pressure_ratio(symbol);
        match side {
            Side::Long => r > self.config.support_threshold,
            Side::Short => r < -self.config.support_threshold,
        }
    }

    /// Over the last `exhaustion_ticks` readings the opposing side added at
    /// least `exhaustion_factor` times the supporting side's quantity
    pub fn check_exhaustion_aggression(&self, symbol: &str, side: Side) -> bool {
        let n = self.config.exhaustion_ticks.max(2);
        let Some(h) = self.history.get(symbol) else {
            return false;
        };
        if h.len() < n {
            return false;
        }
        let first = &h[h.len() - n];
        let last = &h[h.len() - 1];
        let db = (last.tbq - first.tbq) as f64;
        let ds = (last.tsq - first.tsq) as f64;
        let factor = self.config.exhaustion_factor;
        match side {
            Side::Long => ds > 0.0 && ds >= db * factor,
            Side::Short => db > 0.0 && db >= ds * factor,
        }
    }

    pub fn reset(&mut self, symbol: &str) {
        self.history.remove(symbol);
    }
}
