//! Configuration for the decision engine
//!
//! Every section has a `Default` carrying the production values, so a JSON
//! config file only needs to name the values it overrides.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum price increment
    pub tick_size: f64,
    /// Exchange time zone used for session alignment and "today"
    pub session_timezone: Tz,
    /// Exchange open time in `session_timezone`
    pub session_open: NaiveTime,
    pub footprint: FootprintConfig,
    pub atr: AtrConfig,
    pub stops: StopConfig,
    pub profile: ProfileConfig,
    pub timeframe: TimeframeConfig,
    pub orderbook: OrderBookConfig,
    pub pressure: PressureConfig,
    pub guards: GuardConfig,
    pub exits: ExitConfig,
    pub entry: EntryConfig,
    pub persistence: PersistenceConfig,
    pub dispatch: DispatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_size: 0.05,
            session_timezone: chrono_tz::Asia::Kolkata,
            session_open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            footprint: FootprintConfig::default(),
            atr: AtrConfig::default(),
            stops: StopConfig::default(),
            profile: ProfileConfig::default(),
            timeframe: TimeframeConfig::default(),
            orderbook: OrderBookConfig::default(),
            pressure: PressureConfig::default(),
            guards: GuardConfig::default(),
            exits: ExitConfig::default(),
            entry: EntryConfig::default(),
            persistence: PersistenceConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Hybrid footprint bar rotation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FootprintConfig {
    /// Rotate after this many seconds
    pub max_duration_secs: i64,
    /// Rotate once accumulated quantity reaches this
    pub max_volume: u64,
    /// Rotate once this many fills were seen
    pub max_ticks: u64,
    /// Derive `max_volume` from recent average 1-minute volume
    pub calibrate: bool,
    /// Candles required before calibration kicks in
    pub calibration_min_candles: usize,
    /// Most recent candles averaged for calibration
    pub calibration_window: usize,
    /// Feed every closed footprint bar into the candle-close path
    pub synthetic_candles: bool,
}

impl Default for FootprintConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 60,
            max_volume: 5000,
            max_ticks: 300,
            calibrate: true,
            calibration_min_candles: 10,
            calibration_window: 200,
            synthetic_candles: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AtrConfig {
    pub period: usize,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self { period: 14 }
    }
}

/// Stop placement and trailing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub atr_mult: f64,
    /// Minimum stop distance as a fraction of entry price
    pub min_stop_pct: f64,
    /// Maximum stop distance as a fraction of entry price
    pub max_stop_pct: f64,
    /// Take-profit distance in multiples of initial risk
    pub reward_risk: f64,
    /// Chandelier multiple while pressure is trending
    pub trail_mult_trending: f64,
    /// Chandelier multiple otherwise
    pub trail_mult_normal: f64,
    /// Candle-close hardening offset in ATR units (0 disables)
    pub candle_trail_atr_frac: f64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            atr_mult: 1.8,
            min_stop_pct: 0.004,
            max_stop_pct: 0.025,
            reward_risk: 3.0,
            trail_mult_trending: 4.0,
            trail_mult_normal: 3.0,
            candle_trail_atr_frac: 0.2,
        }
    }
}

/// Volume profile, auction regime and high-volume bar classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Rolling candle window for the profile
    pub lookback: usize,
    pub value_area_pct: f64,
    /// POC distance from value-area midpoint, as a fraction of VA width
    pub balance_tolerance: f64,
    /// K in mean + K * stddev
    pub spike_std_devs: f64,
    /// Trailing candles used for the spike distribution
    pub spike_window: usize,
    /// Minimum trailing candles before spikes are detected
    pub spike_min_history: usize,
    pub chop_vwap_pct: f64,
    pub chop_volume_ratio: f64,
    pub trend_min_volume_ratio: f64,
    pub reaction_zone_lookback: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            lookback: 120,
            value_area_pct: 0.70,
            balance_tolerance: 0.20,
            spike_std_devs: 4.0,
            spike_window: 50,
            spike_min_history: 20,
            chop_vwap_pct: 0.0005,
            chop_volume_ratio: 1.5,
            trend_min_volume_ratio: 0.8,
            reaction_zone_lookback: 100,
        }
    }
}

/// Higher-timeframe trend context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeframeConfig {
    pub minutes: u32,
    pub sma_period: usize,
    /// Consecutive closes on one side of the SMA before bias flips
    pub confirm_candles: usize,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            minutes: 60,
            sma_period: 20,
            confirm_candles: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    pub imbalance_ratio: f64,
    /// Snapshots retained per symbol
    pub history: usize,
    pub absorption_snapshots: usize,
    pub absorption_min_qty: f64,
    /// Allowed best-price deterioration during absorption
    pub absorption_price_tolerance: f64,
    /// Level qty above this multiple of the side's average is a wall
    pub wall_multiple: f64,
    /// Exit when price is within this fraction of a wall
    pub wall_proximity_pct: f64,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            imbalance_ratio: 1.5,
            history: 20,
            absorption_snapshots: 5,
            absorption_min_qty: 500.0,
            absorption_price_tolerance: 0.001,
            wall_multiple: 3.0,
            wall_proximity_pct: 0.001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Observations kept (20-50)
    pub window: usize,
    pub trend_threshold: f64,
    /// Ratio beyond which pressure still supports a position
    pub support_threshold: f64,
    pub exhaustion_ticks: usize,
    pub exhaustion_factor: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            window: 30,
            trend_threshold: 0.5,
            support_threshold: 0.2,
            exhaustion_ticks: 10,
            exhaustion_factor: 1.5,
        }
    }
}

/// Entry guards and add-on limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub bias_window: usize,
    pub bias_min_trades: usize,
    pub bias_loss_threshold: f64,
    pub max_consecutive_losses: u32,
    pub loss_cooldown_candles: i64,
    pub cooldown_secs: i64,
    pub max_adds: u32,
    pub add_threshold_pct: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            bias_window: 20,
            bias_min_trades: 5,
            bias_loss_threshold: 0.55,
            max_consecutive_losses: 2,
            loss_cooldown_candles: 5,
            cooldown_secs: 180,
            max_adds: 2,
            add_threshold_pct: 0.003,
        }
    }
}

/// Early-trade protection and optional exits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub min_hold_secs: i64,
    pub min_profit_pct: f64,
    pub candle_hl_break: bool,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            min_hold_secs: 180,
            min_profit_pct: 0.003,
            candle_hl_break: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Minimum candle volume when no footprint threshold is known
    pub min_volume: f64,
    /// Fraction of the symbol's footprint volume threshold a candle must reach
    pub footprint_volume_fraction: f64,
    /// Pullback "touch" distance as a fraction of the level price
    pub pullback_pct: f64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            min_volume: 1000.0,
            footprint_volume_fraction: 0.7,
            pullback_pct: 0.001,
        }
    }
}

/// Retry policy for trade-state writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Decision-engine workers; symbols are pinned to one by hash
    pub workers: usize,
    /// Bounded queue depth per worker and for ingress
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 4096,
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tick_size > 0.0) {
            bail!("tick_size must be positive");
        }
        if self.atr.period == 0 {
            bail!("atr.period must be at least 1");
        }
        if self.stops.min_stop_pct > self.stops.max_stop_pct {
            bail!("stops.min_stop_pct exceeds stops.max_stop_pct");
        }
        if !(self.profile.value_area_pct > 0.0 && self.profile.value_area_pct <= 1.0) {
            bail!("profile.value_area_pct must be in (0, 1]");
        }
        if self.timeframe.minutes == 0 || self.timeframe.sma_period == 0 {
            bail!("timeframe.minutes and timeframe.sma_period must be positive");
        }
        if self.dispatch.workers == 0 {
            bail!("dispatch.workers must be at least 1");
        }
        Ok(())
    }

    /// Milliseconds of the cooldown after a stop-type exit
    pub fn cooldown_ms(&self) -> i64 {
        self.guards.cooldown_secs * 1000
    }
}
