//! Order-flow inference
//!
//! Classifies each tick's quantity as aggressor buy (lifting the ask) or
//! aggressor sell (hitting the bid) against the best quote, and tracks the
//! change in the book's total buy/sell quantity between ticks.

use std::collections::HashMap;

use crate::types::{round_to_tick, to_ticks, Quote, Tick};

/// A tick split into bid/ask aggression at a tick-rounded price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedFill {
    pub price: f64,
    pub price_ticks: i64,
    /// Quantity that hit the bid (aggressive sells)
    pub bid_qty: f64,
    /// Quantity that lifted the ask (aggressive buys)
    pub ask_qty: f64,
    /// Δ total-buy-qty minus Δ total-sell-qty since the previous tick
    pub absorption: i64,
}

impl ClassifiedFill {
    pub fn volume(&self) -> f64 {
        self.bid_qty + self.ask_qty
    }

    /// Flow delta (ask minus bid)
    pub fn delta(&self) -> f64 {
        self.ask_qty - self.bid_qty
    }

    /// Resting liquidity moved against the aggressor
    pub fn is_absorbed(&self) -> bool {
        (self.delta() > 0.0 && self.absorption < 0) || (self.delta() < 0.0 && self.absorption > 0)
    }
}

#[derive(Debug, Default)]
pub struct OrderFlowInferer {
    tick_size: f64,
    /// Last seen (total_buy_qty, total_sell_qty) per symbol
    prev_totals: HashMap<String, (u64, u64)>,
}

impl OrderFlowInferer {
    pub fn new(tick_size: f64) -> Self {
        Self {
            tick_size,
            prev_totals: HashMap::new(),
        }
    }

    /// Classify a tick. Returns None when the tick carries no quantity or no
    /// quote is known; the per-symbol totals cache updates either way.
    pub fn classify(
        &mut self,
        tick: &Tick,
        quote: Option<Quote>,
        totals: Option<(u64, u64)>,
    ) -> Option<ClassifiedFill> {
        let absorption = match totals {
            Some((tbq, tsq)) => {
                let delta = match self.prev_totals.get(&tick.symbol) {
                    Some(&(prev_b, prev_s)) => {
                        (tbq as i64 - prev_b as i64) - (tsq as i64 - prev_s as i64)
                    }
                    None => 0,
                };
                self.prev_totals.insert(tick.symbol.clone(), (tbq, tsq));
                delta
            }
            None => 0,
        };

        if tick.qty == 0 {
            return None;
        }
        let quote = quote?;

        let qty = tick.qty as f64;
        let (bid_qty, ask_qty) = if tick.price >= quote.ask {
            (0.0, qty)
        } else if tick.price <= quote.bid {
            (qty, 0.0)
        } else {
            // Inside the spread: no look-ahead, split evenly
            (qty / 2.0, qty / 2.0)
        };

        Some(ClassifiedFill {
            price: round_to_tick(tick.price, self.tick_size),
            price_ticks: to_ticks(tick.price, self.tick_size),
            bid_qty,
            ask_qty,
            absorption,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstrumentKind;

    fn tick(price: f64, qty: u64) -> Tick {
        Tick {
            symbol: "X".to_string(),
            price,
            qty,
            ts_ms: 0,
            quote: None,
            kind: InstrumentKind::Market,
        }
    }

    const QUOTE: Quote = Quote { bid: 99.95, ask: 100.05 };

    #[test]
    fn test_aggressor_classification() {
        let mut inf = OrderFlowInferer::new(0.05);

        let buy = inf.classify(&tick(100.05, 10), Some(QUOTE), None).unwrap();
        assert_eq!((buy.bid_qty, buy.ask_qty), (0.0, 10.0));

        let sell = inf.classify(&tick(99.90, 4), Some(QUOTE), None).unwrap();
        assert_eq!((sell.bid_qty, sell.ask_qty), (4.0, 0.0));

        let mid = inf.classify(&tick(100.0, 5), Some(QUOTE), None).unwrap();
        assert_eq!((mid.bid_qty, mid.ask_qty), (2.5, 2.5));
        assert_eq!(mid.price_ticks, 2000);
    }

    #[test]
    fn test_missing_quote_or_qty_is_skipped() {
        let mut inf = OrderFlowInferer::new(0.05);
        assert!(inf.classify(&tick(100.0, 5), None, None).is_none());
        assert!(inf.classify(&tick(100.0, 0), Some(QUOTE), None).is_none());
    }

    #[test]
    fn test_absorption_delta_tracks_totals() {
        let mut inf = OrderFlowInferer::new(0.05);
        let first = inf.classify(&tick(100.05, 1), Some(QUOTE), Some((1000, 1000))).unwrap();
        assert_eq!(first.absorption, 0);

        // Buyers lift the ask while resting buy qty drops: absorbed
        let second = inf.classify(&tick(100.05, 1), Some(QUOTE), Some((900, 1100))).unwrap();
        assert_eq!(second.absorption, -200);
        assert!(second.is_absorbed());
    }
}
