//! Signal Generator
//!
//! Two independent pieces:
//! - High-volume bar classification (IGNITING / EXHAUSTION / NORMAL) from a
//!   volume spike over the trailing candle distribution
//! - Pullback-to-level plus reversal-shape confirmation for standard entries

use serde::{Deserialize, Serialize};

use crate::types::{Bias, Ohlcv};

/// High-volume bar classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BarClass {
    /// Spike with a strong body closing near its extreme; continuation
    Igniting,
    /// Spike with long wicks; rejection
    Exhaustion,
    Normal,
}

/// Volume spike thresholds
#[derive(Debug, Clone, Copy)]
pub struct SpikeParams {
    pub std_devs: f64,
    pub window: usize,
    pub min_history: usize,
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Volume spike test against the candles preceding `current`.
///
/// Flow rate (volume per second between closes) above mean + K·σ trips it;
/// otherwise raw volume above mean + K·σ does.
pub fn is_volume_spike(history: &[Ohlcv], current: &Ohlcv, params: SpikeParams) -> bool {
    if history.len() < params.min_history {
        return false;
    }
    let start = history.len().saturating_sub(params.window);
    let subset = &history[start..];
    if subset.len() < 2 {
        return false;
    }

    let rates: Vec<f64> = subset
        .windows(2)
        .map(|w| w[1].volume / duration_secs(w[0].ts_ms, w[1].ts_ms))
        .collect();
    let (rate_mean, rate_std) = mean_std(&rates);

    let last_ts = subset[subset.len() - 1].ts_ms;
    let current_rate = current.volume / duration_secs(last_ts, current.ts_ms);
    if current_rate > rate_mean + params.std_devs * rate_std {
        return true;
    }

    let volumes: Vec<f64> = subset.iter().map(|c| c.volume).collect();
    let (vol_mean, vol_std) = mean_std(&volumes);
    current.volume > vol_mean + params.std_devs * vol_std
}

fn duration_secs(prev_ts: i64, ts: i64) -> f64 {
    let secs = (ts - prev_ts) as f64 / 1000.0;
    if secs <= 0.0 {
        1.0
    } else {
        secs
    }
}

/// Classify `current` against its trailing history
pub fn classify_bar(history: &[Ohlcv], current: &Ohlcv, params: SpikeParams) -> BarClass {
    if !is_volume_spike(history, current, params) {
        return BarClass::Normal;
    }
    let range = current.range();
    if range <= 0.0 {
        return BarClass::Normal;
    }

    let body_ratio = current.body() / range;
    if body_ratio > 0.5 {
        let wick_at_close = if current.is_green() {
            current.high - current.close
        } else {
            current.close - current.low
        };
        if wick_at_close / range < 0.2 {
            return BarClass::Igniting;
        }
    }
    if body_ratio < 0.3 {
        return BarClass::Exhaustion;
    }
    BarClass::Normal
}

/// Reference prices for the pullback test
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PullbackLevels {
    pub support: Option<f64>,
    pub resistance: Option<f64>,
}

pub struct SignalGenerator {
    /// Touch distance as a fraction of the level price
    pullback_pct: f64,
}

impl SignalGenerator {
    pub fn new(pullback_pct: f64) -> Self {
        Self { pullback_pct }
    }

    pub fn check_pullback(&self, candle: &Ohlcv, levels: &PullbackLevels, bias: Bias) -> bool {
        let (level, touch) = match bias {
            Bias::Bullish => (levels.support, candle.low),
            Bias::Bearish => (levels.resistance, candle.high),
        };
        match level {
            Some(level) if level > 0.0 => (touch - level).abs() / level <= self.pullback_pct,
            _ => false,
        }
    }

    /// Hammer for bullish, shooting star for bearish
    pub fn check_reversal_pattern(&self, candle: &Ohlcv, bias: Bias) -> bool {
        if candle.range() == 0.0 {
            return false;
        }
        let body = candle.body();
        let upper_wick = candle.high - candle.open.max(candle.close);
        let lower_wick = candle.open.min(candle.close) - candle.low;

        match bias {
            Bias::Bullish => lower_wick > 2.0 * body && upper_wick < body,
            Bias::Bearish => upper_wick > 2.0 * body && lower_wick < body,
        }
    }

    /// Reversal shape at a key level in the bias direction
    pub fn get_signal(&self, candle: &Ohlcv, levels: &PullbackLevels, bias: Option<Bias>) -> Option<Bias> {
        let bias = bias?;
        (self.check_reversal_pattern(candle, bias) && self.check_pullback(candle, levels, bias)).then_some(bias)
    }
}
