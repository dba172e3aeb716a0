use serde::{Deserialize, Serialize};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1.0 for long, -1.0 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Higher-timeframe directional bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bias {
    Bullish,
    Bearish,
}

impl Bias {
    /// The only trade side this bias permits
    pub fn side(self) -> Side {
        match self {
            Bias::Bullish => Side::Long,
            Bias::Bearish => Side::Short,
        }
    }
}

/// Instruments whose volume is structurally absent (indices) skip volume logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    #[default]
    Market,
    Index,
}

/// Best bid/ask carried along with a tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

/// One trade/quote update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    /// Last traded quantity. Zero-quantity ticks still drive exits and rotation.
    pub qty: u64,
    pub ts_ms: i64,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub kind: InstrumentKind,
}

impl Tick {
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && !self.symbol.is_empty()
    }
}

/// OHLCV values without identity, kept in rolling windows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Close timestamp (ms)
    pub ts_ms: i64,
}

impl Ohlcv {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn is_green(&self) -> bool {
        self.close > self.open
    }

    pub fn is_red(&self) -> bool {
        self.close < self.open
    }
}

/// Closed OHLCV bar for a timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Timeframe in minutes (1 for the decision path)
    #[serde(default = "default_timeframe")]
    pub timeframe: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Close timestamp (ms)
    pub ts_ms: i64,
    #[serde(default)]
    pub kind: InstrumentKind,
}

fn default_timeframe() -> u32 {
    1
}

impl Candle {
    /// All finite, L > 0, H >= max(O,C), L <= min(O,C)
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.low > 0.0
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.volume >= 0.0
    }

    pub fn bar(&self) -> Ohlcv {
        Ohlcv {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            ts_ms: self.ts_ms,
        }
    }
}

/// A single visible book level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: u64,
}

/// Bounded-depth order book view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub ts_ms: i64,
    /// Best (highest) bid first
    pub bids: Vec<BookLevel>,
    /// Best (lowest) ask first
    pub asks: Vec<BookLevel>,
    pub total_buy_qty: u64,
    pub total_sell_qty: u64,
}

impl BookSnapshot {
    /// Drop empty levels and restore best-first ordering
    pub fn normalized(mut self) -> Self {
        self.bids.retain(|l| l.qty > 0 && l.price > 0.0 && l.price.is_finite());
        self.asks.retain(|l| l.qty > 0 && l.price > 0.0 && l.price.is_finite());
        self.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        self
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }
}

/// Price expressed in whole ticks, used as a stable map key
pub fn to_ticks(price: f64, tick_size: f64) -> i64 {
    (price / tick_size).round() as i64
}

pub fn from_ticks(ticks: i64, tick_size: f64) -> f64 {
    round_to_tick(ticks as f64 * tick_size, tick_size)
}

/// Round to the nearest tick, trimming float noise from the multiplication
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    let rounded = (price / tick_size).round() * tick_size;
    (rounded * 1e8).round() / 1e8
}
