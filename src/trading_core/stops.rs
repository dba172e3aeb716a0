//! Stop placement and trailing
//!
//! Initial stops are an ATR multiple clamped to a percentage band of entry,
//! widened to the order-book stop when that is further out (never past the
//! band's maximum). Trailing uses a chandelier anchored at the best price
//! since entry and only ever tightens.

use crate::config::StopConfig;
use crate::types::{round_to_tick, Side};

use super::trades::Trade;

pub struct StopNormalizer {
    config: StopConfig,
    tick_size: f64,
}

impl StopNormalizer {
    pub fn new(config: StopConfig, tick_size: f64) -> Self {
        Self { config, tick_size }
    }

    /// ATR distance clamped to [min_stop_pct, max_stop_pct] of entry
    pub fn atr_distance(&self, entry: f64, atr: f64) -> f64 {
        let min_dist = entry * self.config.min_stop_pct;
        let max_dist = entry * self.config.max_stop_pct;
        min_dist.max((atr * self.config.atr_mult).min(max_dist))
    }

    pub fn initial_stop(&self, entry: f64, side: Side, atr: f64) -> f64 {
        round_to_tick(entry - side.sign() * self.atr_distance(entry, atr), self.tick_size)
    }

    /// Wider of the ATR stop and the book stop, capped at the max distance
    pub fn combined_stop(&self, entry: f64, side: Side, atr: f64, book_stop: Option<f64>) -> f64 {
        let atr_dist = self.atr_distance(entry, atr);
        let book_dist = book_stop
            .map(|s| (entry - s) * side.sign())
            .filter(|d| *d > 0.0)
            .unwrap_or(0.0);
        let dist = atr_dist.max(book_dist).min(entry * self.config.max_stop_pct);
        round_to_tick(entry - side.sign() * dist, self.tick_size)
    }

    /// Igniting entries risk only to the signal bar's opposite extreme
    pub fn igniting_stop(&self, side: Side, bar_low: f64, bar_high: f64) -> f64 {
        let stop = match side {
            Side::Long => bar_low - self.tick_size,
            Side::Short => bar_high + self.tick_size,
        };
        round_to_tick(stop, self.tick_size)
    }

    /// entry +/- reward_risk x initial risk
    pub fn take_profit(&self, entry: f64, stop: f64, side: Side) -> f64 {
        let risk = (entry - stop).abs();
        round_to_tick(entry + side.sign() * self.config.reward_risk * risk, self.tick_size)
    }

    pub fn trail_mult(&self, trending: bool) -> f64 {
        if trending {
            self.config.trail_mult_trending
        } else {
            self.config.trail_mult_normal
        }
    }

    /// Chandelier trail from the best price seen. Returns the new stop if it
    /// tightened.
    pub fn trail(&self, trade: &mut Trade, price: f64, atr: f64, trending: bool) -> Option<f64> {
        trade.mark_price(price);
        let offset = self.trail_mult(trending) * atr;
        let candidate = round_to_tick(trade.best_price - trade.side.sign() * offset, self.tick_size);
        trade.tighten_stop(candidate).then_some(trade.stop_price)
    }

    /// Candle-close hardening: LONG to low - frac·ATR, SHORT to high + frac·ATR
    pub fn harden_on_candle(&self, trade: &mut Trade, low: f64, high: f64, atr: f64) -> Option<f64> {
        let frac = self.config.candle_trail_atr_frac;
        if frac <= 0.0 {
            return None;
        }
        let candidate = match trade.side {
            Side::Long => low - atr * frac,
            Side::Short => high + atr * frac,
        };
        let candidate = round_to_tick(candidate, self.tick_size);
        trade.tighten_stop(candidate).then_some(trade.stop_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::trades::EntryKind;

    fn normalizer() -> StopNormalizer {
        StopNormalizer::new(StopConfig::default(), 0.05)
    }

    #[test]
    fn test_long_stop_and_target_at_100() {
        let n = normalizer();
        // max(0.4, min(3.6, 2.5)) = 2.5
        let stop = n.initial_stop(100.0, Side::Long, 2.0);
        assert_eq!(stop, 97.5);
        assert_eq!(n.take_profit(100.0, stop, Side::Long), 107.5);
    }

    #[test]
    fn test_min_distance_floor_and_short_side() {
        let n = normalizer();
        // ATR distance 0.18 below the 0.4 floor
        assert_eq!(n.initial_stop(100.0, Side::Short, 0.1), 100.4);
        assert_eq!(n.take_profit(100.0, 100.4, Side::Short), 98.8);
    }

    #[test]
    fn test_combined_stop_prefers_wider_but_caps() {
        let n = normalizer();
        // ATR dist 0.9, book dist 1.5 -> 1.5
        assert_eq!(n.combined_stop(100.0, Side::Long, 0.5, Some(98.5)), 98.5);
        // Book stop beyond the cap -> max 2.5
        assert_eq!(n.combined_stop(100.0, Side::Long, 0.5, Some(90.0)), 97.5);
        // Tighter book stop -> ATR distance
        assert_eq!(n.combined_stop(100.0, Side::Long, 0.5, Some(99.8)), 99.1);
    }

    #[test]
    fn test_trailing_never_loosens() {
        let n = normalizer();
        let mut trade = Trade::open("X", Side::Long, 100.0, 0, 97.5, 107.5, EntryKind::Standard);

        assert_eq!(n.trail(&mut trade, 104.0, 1.0, true), Some(100.0));
        // Pullback keeps the anchor
        assert_eq!(n.trail(&mut trade, 101.0, 1.0, false), Some(101.0));
        assert_eq!(n.trail(&mut trade, 102.0, 1.0, true), None);
        assert_eq!(trade.stop_price, 101.0);

        // Wider ATR would loosen: ignored
        assert_eq!(n.trail(&mut trade, 103.0, 5.0, false), None);
        assert_eq!(trade.stop_price, 101.0);
    }

    #[test]
    fn test_candle_hardening() {
        let n = normalizer();
        let mut trade = Trade::open("X", Side::Short, 100.0, 0, 102.5, 92.5, EntryKind::Standard);
        assert_eq!(n.harden_on_candle(&mut trade, 99.0, 101.0, 1.0), Some(101.2));
        assert_eq!(n.harden_on_candle(&mut trade, 99.0, 101.5, 1.0), None);
        assert!(trade.stop_tightened());
    }
}
