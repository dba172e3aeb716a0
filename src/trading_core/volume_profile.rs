//! Volume Profile and Auction Context
//!
//! Builds a tick-level volume histogram over a rolling candle window and
//! derives POC, value area and the balanced/trending regime. The auction
//! context gates entries on that regime:
//! - Balanced: fade the value-area extremes
//! - Unbalanced: join the dominant side on the right side of VWAP
//!
//! Igniting bars bypass the regime when their direction matches the side.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

use super::signals::{classify_bar, BarClass, SpikeParams};
use crate::config::ProfileConfig;
use crate::types::{from_ticks, to_ticks, Ohlcv, Side};

/// Widest window, in ticks, a profile is built over
pub const MAX_PROFILE_TICKS: i64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DominantSide {
    Buyer,
    Seller,
}

#[derive(Debug, Clone)]
pub struct VolumeProfile {
    tick_size: f64,
    /// Tick index of `volumes[0]`
    base_tick: i64,
    volumes: Vec<f64>,
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
}

impl VolumeProfile {
    /// None for an empty window or one spanning more than `MAX_PROFILE_TICKS`
    pub fn from_candles(candles: &[Ohlcv], tick_size: f64, value_area_pct: f64) -> Option<Self> {
        let min_tick = candles.iter().map(|c| to_ticks(c.low, tick_size)).min()?;
        let max_tick = candles.iter().map(|c| to_ticks(c.high, tick_size)).max()?;
        if max_tick < min_tick {
            return None;
        }
        if max_tick.saturating_sub(min_tick) > MAX_PROFILE_TICKS {
            warn!(
                "Volume profile window spans {} ticks, skipping",
                max_tick.saturating_sub(min_tick)
            );
            return None;
        }

        let mut volumes = vec![0.0; (max_tick - min_tick + 1) as usize];
        for c in candles {
            let lo = to_ticks(c.low, tick_size);
            let hi = to_ticks(c.high, tick_size).max(lo);
            let per_level = c.volume / (hi - lo + 1) as f64;
            for t in lo..=hi {
                volumes[(t - min_tick) as usize] += per_level;
            }
        }

        // First maximum wins ties
        let mut poc_ix = 0;
        for (i, v) in volumes.iter().enumerate() {
            if *v > volumes[poc_ix] {
                poc_ix = i;
            }
        }

        let total: f64 = volumes.iter().sum();
        let target = total * value_area_pct;
        let mut area = volumes[poc_ix];
        let (mut lo_ix, mut hi_ix) = (poc_ix, poc_ix);

        while area < target {
            let up = (hi_ix + 1 < volumes.len()).then(|| volumes[hi_ix + 1]);
            let down = (lo_ix > 0).then(|| volumes[lo_ix - 1]);
            let take_upper = match (up, down) {
                (Some(u), Some(d)) => u > d,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_upper {
                hi_ix += 1;
                area += volumes[hi_ix];
            } else {
                lo_ix -= 1;
                area += volumes[lo_ix];
            }
        }

        let price = |ix: usize| from_ticks(min_tick + ix as i64, tick_size);
        Some(Self {
            tick_size,
            base_tick: min_tick,
            poc: price(poc_ix),
            vah: price(hi_ix),
            val: price(lo_ix),
            volumes,
        })
    }

    pub fn total_volume(&self) -> f64 {
        self.volumes.iter().sum()
    }

    /// Volume accumulated between two prices, inclusive
    pub fn volume_between(&self, low: f64, high: f64) -> f64 {
        let lo = to_ticks(low, self.tick_size) - self.base_tick;
        let hi = to_ticks(high, self.tick_size) - self.base_tick;
        self.volumes
            .iter()
            .enumerate()
            .filter(|(i, _)| (*i as i64) >= lo && (*i as i64) <= hi)
            .map(|(_, v)| v)
            .sum()
    }

    fn midpoint(&self) -> f64 {
        self.val + (self.vah - self.val) / 2.0
    }

    /// POC within `tolerance` x VA width of the VA midpoint
    pub fn is_balanced(&self, tolerance: f64) -> bool {
        (self.poc - self.midpoint()).abs() <= (self.vah - self.val) * tolerance
    }

    /// Only meaningful when unbalanced
    pub fn dominant_side(&self, tolerance: f64) -> Option<DominantSide> {
        if self.is_balanced(tolerance) {
            return None;
        }
        Some(if self.poc > self.midpoint() {
            DominantSide::Buyer
        } else {
            DominantSide::Seller
        })
    }
}

/// Price band around the highest-volume candle's wick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReactionZone {
    /// Upper wick of a red candle
    Resistance { bottom: f64, top: f64 },
    /// Lower wick of a green candle
    Support { bottom: f64, top: f64 },
}

impl ReactionZone {
    fn blocks(&self, side: Side, close: f64) -> bool {
        match (*self, side) {
            (ReactionZone::Resistance { bottom, top }, Side::Long)
            | (ReactionZone::Support { bottom, top }, Side::Short) => close >= bottom && close <= top,
            _ => false,
        }
    }
}

pub struct AuctionContext {
    config: ProfileConfig,
    tick_size: f64,
    candles: HashMap<String, VecDeque<Ohlcv>>,
}

impl AuctionContext {
    pub fn new(config: ProfileConfig, tick_size: f64) -> Self {
        Self {
            config,
            tick_size,
            candles: HashMap::new(),
        }
    }

    fn spike_params(&self) -> SpikeParams {
        SpikeParams {
            std_devs: self.config.spike_std_devs,
            window: self.config.spike_window,
            min_history: self.config.spike_min_history,
        }
    }

    /// Classify the candle against prior history, then add it to the window
    pub fn on_candle(&mut self, symbol: &str, candle: &Ohlcv) -> BarClass {
        let params = self.spike_params();
        let lookback = self.config.lookback.max(1);
        let window = self.candles.entry(symbol.to_string()).or_default();

        let history: Vec<Ohlcv> = window.iter().copied().collect();
        let class = classify_bar(&history, candle, params);

        window.push_back(*candle);
        while window.len() > lookback {
            window.pop_front();
        }
        class
    }

    pub fn volume_profile(&self, symbol: &str) -> Option<VolumeProfile> {
        let window = self.candles.get(symbol)?;
        if window.len() < self.config.lookback {
            return None;
        }
        let candles: Vec<Ohlcv> = window.iter().copied().collect();
        VolumeProfile::from_candles(&candles, self.tick_size, self.config.value_area_pct)
    }

    /// Typical-price VWAP over the window
    pub fn vwap(&self, symbol: &str) -> Option<f64> {
        let window = self.candles.get(symbol)?;
        let (pv, vol) = window.iter().fold((0.0, 0.0), |(pv, vol), c| {
            let typical = (c.high + c.low + c.close) / 3.0;
            (pv + typical * c.volume, vol + c.volume)
        });
        (vol > 0.0).then(|| pv / vol)
    }

    pub fn reaction_zone(&self, symbol: &str) -> Option<ReactionZone> {
        let window = self.candles.get(symbol)?;
        if window.len() < self.config.spike_min_history {
            return None;
        }
        let start = window.len().saturating_sub(self.config.reaction_zone_lookback);
        let c = window
            .iter()
            .skip(start)
            .fold(None::<&Ohlcv>, |best, c| match best {
                Some(b) if b.volume >= c.volume => Some(b),
                _ => Some(c),
            })?;

        Some(if c.is_red() {
            ReactionZone::Resistance { bottom: c.open, top: c.high }
        } else {
            ReactionZone::Support { bottom: c.low, top: c.open }
        })
    }

    /// Regime gate for a candle already added by `on_candle`
    pub fn allow_trade(&self, symbol: &str, candle: &Ohlcv, side: Side, class: BarClass) -> bool {
        let Some(window) = self.candles.get(symbol) else {
            return false;
        };
        if window.len() < self.config.lookback {
            return false;
        }

        if class == BarClass::Igniting {
            match side {
                Side::Long if candle.is_green() => return true,
                Side::Short if candle.is_red() => return true,
                _ => {}
            }
        }

        let (Some(vp), Some(vwap)) = (self.volume_profile(symbol), self.vwap(symbol)) else {
            return false;
        };

        let avg_vol = window.iter().map(|c| c.volume).sum::<f64>() / window.len() as f64;
        let vol_ratio = if avg_vol > 0.0 { candle.volume / avg_vol } else { 0.0 };
        let dist_to_vwap = (candle.close - vwap).abs() / vwap;

        if dist_to_vwap < self.config.chop_vwap_pct && vol_ratio < self.config.chop_volume_ratio {
            return false;
        }

        if let Some(zone) = self.reaction_zone(symbol) {
            if zone.blocks(side, candle.close) {
                return false;
            }
        }

        let tolerance = self.config.balance_tolerance;
        if vp.is_balanced(tolerance) {
            return match side {
                Side::Long => candle.close <= vp.val,
                Side::Short => candle.close >= vp.vah,
            };
        }

        if vol_ratio < self.config.trend_min_volume_ratio {
            return false;
        }
        match (side, vp.dominant_side(tolerance)) {
            (Side::Long, Some(DominantSide::Buyer)) => candle.close >= vwap && candle.close >= vp.val,
            (Side::Short, Some(DominantSide::Seller)) => candle.close <= vwap && candle.close <= vp.vah,
            _ => false,
        }
    }
}
