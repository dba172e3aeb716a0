//! Wilder ATR per symbol

use std::collections::HashMap;

use crate::types::Ohlcv;

#[derive(Debug, Clone, Default)]
struct AtrState {
    prev_close: Option<f64>,
    tr_sum: f64,
    count: usize,
    atr: Option<f64>,
}

#[derive(Debug)]
pub struct AtrTracker {
    period: usize,
    states: HashMap<String, AtrState>,
}

impl AtrTracker {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            states: HashMap::new(),
        }
    }

    /// Feed a closed candle. Returns the ATR once warm-up completes.
    pub fn update(&mut self, symbol: &str, bar: &Ohlcv) -> Option<f64> {
        let period = self.period;
        let state = self.states.entry(symbol.to_string()).or_default();

        let tr = match state.prev_close {
            None => bar.high - bar.low,
            Some(pc) => (bar.high - bar.low)
                .max((bar.high - pc).abs())
                .max((bar.low - pc).abs()),
        };
        state.prev_close = Some(bar.close);

        state.atr = match state.atr {
            Some(atr) => Some((atr * (period as f64 - 1.0) + tr) / period as f64),
            None => {
                state.tr_sum += tr;
                state.count += 1;
                (state.count >= period).then(|| state.tr_sum / period as f64)
            }
        };
        state.atr
    }

    pub fn get_atr(&self, symbol: &str) -> Option<f64> {
        self.states.get(symbol).and_then(|s| s.atr)
    }
}
