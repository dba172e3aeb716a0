//! Multi-Timeframe Aggregator
//!
//! Rolls 1-minute candles into N-minute candles whose windows are aligned to
//! the session open rather than the wall clock, and derives an SMA trend bias
//! with hysteresis: the bias only flips after `confirm_candles` consecutive
//! completed bars close on the same side of the SMA.

use chrono::{DateTime, NaiveTime, Timelike};
use chrono_tz::Tz;
use std::collections::{HashMap, VecDeque};
use tracing::info;

use super::signals::PullbackLevels;
use crate::config::TimeframeConfig;
use crate::types::{Bias, Ohlcv, Side};

/// Swing references over the last few completed bars
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HtfLevels {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl From<HtfLevels> for PullbackLevels {
    fn from(levels: HtfLevels) -> Self {
        PullbackLevels {
            support: Some(levels.low),
            resistance: Some(levels.high),
        }
    }
}

#[derive(Debug, Default)]
struct Frame {
    window_start: i64,
    current: Option<Ohlcv>,
    history: VecDeque<Ohlcv>,
    bias: Option<Bias>,
    /// Direction of the current run of closes vs SMA, and its length
    streak: Option<(Bias, usize)>,
}

pub struct TimeframeAggregator {
    config: TimeframeConfig,
    tz: Tz,
    session_open_secs: i64,
    frames: HashMap<String, Frame>,
}

impl TimeframeAggregator {
    pub fn new(config: TimeframeConfig, tz: Tz, session_open: NaiveTime) -> Self {
        Self {
            config,
            tz,
            session_open_secs: session_open.num_seconds_from_midnight() as i64,
            frames: HashMap::new(),
        }
    }

    pub fn minutes(&self) -> u32 {
        self.config.minutes
    }

    fn history_cap(&self) -> usize {
        self.config.sma_period + 10
    }

    /// Start (UTC ms) of the session-aligned window containing `ts_ms`
    pub fn window_start(&self, ts_ms: i64) -> i64 {
        let Some(utc) = DateTime::from_timestamp_millis(ts_ms) else {
            return ts_ms;
        };
        let local = utc.with_timezone(&self.tz);
        let since_midnight = local.num_seconds_from_midnight() as i64;
        let since_open = (since_midnight - self.session_open_secs).max(0);
        let window = self.config.minutes as i64 * 60;
        let index = since_open / window;

        let midnight_secs = ts_ms.div_euclid(1000) - since_midnight;
        (midnight_secs + self.session_open_secs + index * window) * 1000
    }

    /// Feed a 1-minute candle. Returns the completed higher-timeframe candle
    /// when this candle opens a new window.
    pub fn on_candle(&mut self, symbol: &str, candle: &Ohlcv) -> Option<Ohlcv> {
        let start = self.window_start(candle.ts_ms);
        let cap = self.history_cap();
        let sma_period = self.config.sma_period;
        let confirm = self.config.confirm_candles;
        let minutes = self.config.minutes;

        let frame = self.frames.entry(symbol.to_string()).or_insert_with(|| Frame {
            window_start: start,
            ..Default::default()
        });

        let mut completed = None;
        if start > frame.window_start {
            if let Some(done) = frame.current.take() {
                push_history(frame, done, cap);
                if let Some(bias) = update_bias(frame, &done, sma_period, confirm) {
                    info!(
                        "[{}m] {} BIAS: {:?} (close {:.2})",
                        minutes, symbol, bias, done.close
                    );
                }
                completed = Some(done);
            }
            frame.window_start = start;
        }

        frame.current = Some(match frame.current {
            None => *candle,
            Some(agg) => Ohlcv {
                open: agg.open,
                high: agg.high.max(candle.high),
                low: agg.low.min(candle.low),
                close: candle.close,
                volume: agg.volume + candle.volume,
                ts_ms: candle.ts_ms,
            },
        });
        completed
    }

    /// Cold start from persisted higher-timeframe candles, oldest first
    pub fn seed(&mut self, symbol: &str, candles: &[Ohlcv]) {
        let cap = self.history_cap();
        let sma_period = self.config.sma_period;
        let confirm = self.config.confirm_candles;
        let frame = self.frames.entry(symbol.to_string()).or_default();

        for c in candles {
            if frame.history.back().is_some_and(|last| last.ts_ms >= c.ts_ms) {
                continue;
            }
            push_history(frame, *c, cap);
            update_bias(frame, c, sma_period, confirm);
        }
        if !candles.is_empty() {
            info!(
                "[{}m] Seeded {} candles for {} (bias {:?})",
                self.config.minutes,
                frame.history.len(),
                symbol,
                frame.bias
            );
        }
    }

    pub fn bias(&self, symbol: &str) -> Option<Bias> {
        self.frames.get(symbol).and_then(|f| f.bias)
    }

    pub fn sma(&self, symbol: &str) -> Option<f64> {
        self.frames.get(symbol).and_then(|f| sma(&f.history, self.config.sma_period))
    }

    /// Needs at least three completed bars; uses up to the last five
    pub fn levels(&self, symbol: &str) -> Option<HtfLevels> {
        let frame = self.frames.get(symbol)?;
        if frame.history.len() < 3 {
            return None;
        }
        let recent: Vec<&Ohlcv> = frame.history.iter().rev().take(5).collect();
        Some(HtfLevels {
            high: recent.iter().map(|c| c.high).fold(f64::MIN, f64::max),
            low: recent.iter().map(|c| c.low).fold(f64::MAX, f64::min),
            close: recent[0].close,
        })
    }

    /// LONG only under a bullish bias, SHORT only under bearish; no bias, no trade
    pub fn allow_trade(&self, symbol: &str, side: Side) -> bool {
        self.bias(symbol).is_some_and(|b| b.side() == side)
    }
}

fn push_history(frame: &mut Frame, candle: Ohlcv, cap: usize) {
    frame.history.push_back(candle);
    while frame.history.len() > cap {
        frame.history.pop_front();
    }
}

fn sma(history: &VecDeque<Ohlcv>, period: usize) -> Option<f64> {
    if period == 0 || history.len() < period {
        return None;
    }
    let sum: f64 = history.iter().rev().take(period).map(|c| c.close).sum();
    Some(sum / period as f64)
}

/// Returns the bias if this bar confirmed (or re-confirmed) it
fn update_bias(frame: &mut Frame, candle: &Ohlcv, period: usize, confirm: usize) -> Option<Bias> {
    let sma = sma(&frame.history, period)?;
    let direction = if candle.close > sma {
        Bias::Bullish
    } else if candle.close < sma {
        Bias::Bearish
    } else {
        return None;
    };

    let count = match frame.streak {
        Some((d, n)) if d == direction => n + 1,
        _ => 1,
    };
    frame.streak = Some((direction, count));

    if count >= confirm {
        frame.bias = Some(direction);
        Some(direction)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn aggregator(minutes: u32, sma_period: usize, confirm: usize) -> TimeframeAggregator {
        TimeframeAggregator::new(
            TimeframeConfig { minutes, sma_period, confirm_candles: confirm },
            chrono_tz::Asia::Kolkata,
            NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
        )
    }

    fn ist_ms(h: u32, m: u32) -> i64 {
        chrono_tz::Asia::Kolkata
            .from_local_datetime(&NaiveDate::from_ymd_opt(2025, 3, 10).unwrap().and_hms_opt(h, m, 0).unwrap())
            .unwrap()
            .timestamp_millis()
    }

    fn bar(close: f64, ts_ms: i64) -> Ohlcv {
        Ohlcv { open: close, high: close + 1.0, low: close - 1.0, close, volume: 10.0, ts_ms }
    }

    #[test]
    fn test_windows_align_to_session_open() {
        let agg = aggregator(60, 20, 3);
        assert_eq!(agg.window_start(ist_ms(9, 15)), ist_ms(9, 15));
        assert_eq!(agg.window_start(ist_ms(10, 14)), ist_ms(9, 15));
        assert_eq!(agg.window_start(ist_ms(10, 15)), ist_ms(10, 15));
        assert_eq!(agg.window_start(ist_ms(11, 0)), ist_ms(10, 15));
        // Pre-open folds into the first window
        assert_eq!(agg.window_start(ist_ms(9, 0)), ist_ms(9, 15));
    }

    #[test]
    fn test_rollover_emits_aggregate() {
        let mut agg = aggregator(60, 20, 3);
        assert!(agg.on_candle("X", &bar(100.0, ist_ms(9, 16))).is_none());
        assert!(agg.on_candle("X", &bar(103.0, ist_ms(9, 45))).is_none());

        let first = agg.on_candle("X", &bar(101.0, ist_ms(10, 15))).unwrap();
        assert_eq!((first.open, first.close), (100.0, 103.0));
        assert_eq!(first.high, 104.0);

        assert!(agg.on_candle("X", &bar(102.0, ist_ms(10, 16))).is_none());
        let done = agg.on_candle("X", &bar(99.0, ist_ms(11, 15))).unwrap();
        assert_eq!(done.open, 101.0);
        assert_eq!(done.close, 102.0);
        assert_eq!(done.volume, 20.0);
        assert_eq!(done.ts_ms, ist_ms(10, 16));
    }

    #[test]
    fn test_bias_requires_consecutive_confirmation() {
        let mut agg = aggregator(60, 3, 2);
        let closes = [100.0, 100.0, 100.0, 103.0, 104.0];
        let candles: Vec<Ohlcv> = closes.iter().enumerate().map(|(i, c)| bar(*c, i as i64)).collect();

        agg.seed("X", &candles[..4]);
        assert_eq!(agg.bias("X"), None);
        assert!(!agg.allow_trade("X", Side::Long));
        assert!(!agg.allow_trade("X", Side::Short));

        agg.seed("X", &candles[4..]);
        assert_eq!(agg.bias("X"), Some(Bias::Bullish));
        assert!(agg.allow_trade("X", Side::Long));
        assert!(!agg.allow_trade("X", Side::Short));
    }

    #[test]
    fn test_levels_need_three_bars() {
        let mut agg = aggregator(60, 20, 3);
        let candles: Vec<Ohlcv> = (0..6).map(|i| bar(100.0 + i as f64, i)).collect();
        agg.seed("X", &candles[..2]);
        assert!(agg.levels("X").is_none());

        agg.seed("X", &candles[2..]);
        let levels = agg.levels("X").unwrap();
        // Last five closes 101..105
        assert_eq!(levels.high, 106.0);
        assert_eq!(levels.low, 100.0);
        assert_eq!(levels.close, 105.0);
    }
}
