//! Feed adapter messages
//!
//! The engine consumes `FeedMessage`s. Lines arrive either already tagged
//! (`{"type": "Tick", ...}`) or as the vendor full-feed envelope
//! `{"feeds": {symbol: {"fullFeed": {"marketFF" | "indexFF": {...}}}}}`,
//! which is parsed into `FeedSnapshot` and normalized here. Vendor numbers
//! may be sent as JSON strings.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{BookLevel, BookSnapshot, Candle, InstrumentKind, Quote, Tick};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    Tick(Tick),
    CandleClosed(Candle),
    BookSnapshot(BookSnapshot),
}

impl FeedMessage {
    pub fn symbol(&self) -> &str {
        match self {
            FeedMessage::Tick(t) => &t.symbol,
            FeedMessage::CandleClosed(c) => &c.symbol,
            FeedMessage::BookSnapshot(b) => &b.symbol,
        }
    }

    pub fn ts_ms(&self) -> i64 {
        match self {
            FeedMessage::Tick(t) => t.ts_ms,
            FeedMessage::CandleClosed(c) => c.ts_ms,
            FeedMessage::BookSnapshot(b) => b.ts_ms,
        }
    }

    /// Parse one input line into zero or more messages
    pub fn parse_line(line: &str) -> Result<Vec<FeedMessage>, EngineError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        if value.get("feeds").is_some() {
            let envelope: FeedEnvelope = serde_json::from_value(value)?;
            Ok(envelope.into_messages())
        } else {
            Ok(vec![serde_json::from_value(value)?])
        }
    }
}

/// Accepts a number, a numeric string, null or an empty string
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Value(T),
        Text(String),
    }

    Ok(match Option::<Raw<T>>::deserialize(deserializer)? {
        Some(Raw::Value(v)) => Some(v),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ltpc {
    #[serde(default, deserialize_with = "lenient")]
    pub ltp: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub ltt: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub ltq: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BidAskQuote {
    #[serde(rename = "bidP", default, deserialize_with = "lenient")]
    pub bid_price: Option<f64>,
    #[serde(rename = "bidQ", default, deserialize_with = "lenient")]
    pub bid_qty: Option<u64>,
    #[serde(rename = "askP", default, deserialize_with = "lenient")]
    pub ask_price: Option<f64>,
    #[serde(rename = "askQ", default, deserialize_with = "lenient")]
    pub ask_qty: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketLevel {
    #[serde(rename = "bidAskQuote", default)]
    pub bid_ask_quote: Vec<BidAskQuote>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OhlcEntry {
    #[serde(default)]
    pub interval: String,
    #[serde(default, deserialize_with = "lenient")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub close: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub vol: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub ts: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketOhlc {
    #[serde(default)]
    pub ohlc: Vec<OhlcEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketFeed {
    #[serde(default)]
    pub ltpc: Option<Ltpc>,
    #[serde(rename = "marketLevel", default)]
    pub market_level: Option<MarketLevel>,
    #[serde(default, deserialize_with = "lenient")]
    pub tbq: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub tsq: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub atp: Option<f64>,
    #[serde(rename = "marketOHLC", default)]
    pub market_ohlc: Option<MarketOhlc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexFeed {
    #[serde(default)]
    pub ltpc: Option<Ltpc>,
    #[serde(rename = "marketOHLC", default)]
    pub market_ohlc: Option<MarketOhlc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FullFeed {
    #[serde(rename = "marketFF", default)]
    market: Option<MarketFeed>,
    #[serde(rename = "indexFF", default)]
    index: Option<IndexFeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SymbolFeed {
    #[serde(rename = "fullFeed", default)]
    full_feed: Option<FullFeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedEnvelope {
    #[serde(default)]
    feeds: BTreeMap<String, SymbolFeed>,
    #[serde(rename = "currentTs", default, deserialize_with = "lenient")]
    current_ts: Option<i64>,
}

impl FeedEnvelope {
    pub fn snapshots(self) -> Vec<FeedSnapshot> {
        let current_ts = self.current_ts;
        self.feeds
            .into_iter()
            .filter_map(|(symbol, feed)| {
                let full = feed.full_feed?;
                match (full.market, full.index) {
                    (Some(feed), _) => Some(FeedSnapshot::Market { symbol, current_ts, feed }),
                    (None, Some(feed)) => Some(FeedSnapshot::Index { symbol, current_ts, feed }),
                    (None, None) => {
                        debug!("{}: full feed without market or index section", symbol);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn into_messages(self) -> Vec<FeedMessage> {
        self.snapshots().iter().flat_map(FeedSnapshot::normalize).collect()
    }
}

/// One symbol's vendor snapshot
#[derive(Debug, Clone)]
pub enum FeedSnapshot {
    Market {
        symbol: String,
        current_ts: Option<i64>,
        feed: MarketFeed,
    },
    Index {
        symbol: String,
        current_ts: Option<i64>,
        feed: IndexFeed,
    },
}

impl FeedSnapshot {
    pub fn symbol(&self) -> &str {
        match self {
            FeedSnapshot::Market { symbol, .. } | FeedSnapshot::Index { symbol, .. } => symbol,
        }
    }

    pub fn kind(&self) -> InstrumentKind {
        match self {
            FeedSnapshot::Market { .. } => InstrumentKind::Market,
            FeedSnapshot::Index { .. } => InstrumentKind::Index,
        }
    }

    /// Book first, then the tick, then any 1-minute candles, so the tick is
    /// classified against the book it arrived with
    pub fn normalize(&self) -> Vec<FeedMessage> {
        let (ltpc, ohlc, current_ts) = match self {
            FeedSnapshot::Market { feed, current_ts, .. } => (&feed.ltpc, &feed.market_ohlc, *current_ts),
            FeedSnapshot::Index { feed, current_ts, .. } => (&feed.ltpc, &feed.market_ohlc, *current_ts),
        };
        let symbol = self.symbol();
        let kind = self.kind();
        let ts_ms = ltpc.as_ref().and_then(|l| l.ltt).or(current_ts);

        let mut out = Vec::new();
        let mut quote = None;
        if let (FeedSnapshot::Market { feed, .. }, Some(ts_ms)) = (self, ts_ms) {
            if let Some(book) = book_snapshot(symbol, feed, ts_ms) {
                quote = match (book.best_bid(), book.best_ask()) {
                    (Some(bid), Some(ask)) => Some(Quote { bid: bid.price, ask: ask.price }),
                    _ => None,
                };
                out.push(FeedMessage::BookSnapshot(book));
            }
        }

        if let Some(ltpc) = ltpc {
            match (ltpc.ltp, ltpc.ltt) {
                (Some(price), Some(ts)) if price > 0.0 && ts > 0 => out.push(FeedMessage::Tick(Tick {
                    symbol: symbol.to_string(),
                    price,
                    qty: ltpc.ltq.unwrap_or(0),
                    ts_ms: ts,
                    quote,
                    kind,
                })),
                _ => debug!("{}: ltpc without price or time", symbol),
            }
        }

        if let Some(ohlc) = ohlc {
            let mut candles: Vec<Candle> = ohlc
                .ohlc
                .iter()
                .filter(|o| o.interval == "I1")
                .filter_map(|o| {
                    Some(Candle {
                        symbol: symbol.to_string(),
                        timeframe: 1,
                        open: o.open?,
                        high: o.high?,
                        low: o.low?,
                        close: o.close?,
                        volume: o.vol.unwrap_or(0.0),
                        ts_ms: o.ts?,
                        kind,
                    })
                })
                .collect();
            candles.sort_by_key(|c| c.ts_ms);
            out.extend(candles.into_iter().map(FeedMessage::CandleClosed));
        }
        out
    }
}

fn book_snapshot(symbol: &str, feed: &MarketFeed, ts_ms: i64) -> Option<BookSnapshot> {
    let quotes = &feed.market_level.as_ref()?.bid_ask_quote;
    let level = |price: Option<f64>, qty: Option<u64>| match (price, qty) {
        (Some(price), Some(qty)) if price > 0.0 && qty > 0 => Some(BookLevel { price, qty }),
        _ => None,
    };
    let bids: Vec<BookLevel> = quotes.iter().filter_map(|q| level(q.bid_price, q.bid_qty)).collect();
    let asks: Vec<BookLevel> = quotes.iter().filter_map(|q| level(q.ask_price, q.ask_qty)).collect();
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(
        BookSnapshot {
            symbol: symbol.to_string(),
            ts_ms,
            bids,
            asks,
            total_buy_qty: feed.tbq.unwrap_or(0.0).max(0.0) as u64,
            total_sell_qty: feed.tsq.unwrap_or(0.0).max(0.0) as u64,
        }
        .normalized(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKET: &str = r#"{
        "feeds": {
            "NSE_EQ|INE002A01018": {
                "fullFeed": {
                    "marketFF": {
                        "ltpc": { "ltp": 2450.5, "ltt": "1741582800000", "ltq": "25" },
                        "marketLevel": { "bidAskQuote": [
                            { "bidP": 2450.4, "bidQ": "120", "askP": 2450.55, "askQ": 80 },
                            { "bidP": 2450.3, "bidQ": "60", "askP": 2450.6, "askQ": "0" }
                        ] },
                        "tbq": "150000", "tsq": 98000, "atp": "2449.1",
                        "marketOHLC": { "ohlc": [
                            { "interval": "1d", "open": 2400, "high": 2460, "low": 2390, "close": 2450.5, "vol": "1000000", "ts": "1741545000000" },
                            { "interval": "I1", "open": 2449, "high": 2451, "low": 2448.5, "close": 2450.5, "vol": "5400", "ts": "1741582740000" }
                        ] }
                    }
                }
            }
        },
        "currentTs": "1741582800123"
    }"#;

    #[test]
    fn test_market_snapshot_normalizes_to_book_tick_candle() {
        let messages = FeedMessage::parse_line(MARKET).unwrap();
        assert_eq!(messages.len(), 3);

        let FeedMessage::BookSnapshot(book) = &messages[0] else { panic!("expected book") };
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.total_buy_qty, 150_000);
        assert_eq!(book.total_sell_qty, 98_000);

        let FeedMessage::Tick(tick) = &messages[1] else { panic!("expected tick") };
        assert_eq!(tick.price, 2450.5);
        assert_eq!(tick.qty, 25);
        assert_eq!(tick.ts_ms, 1_741_582_800_000);
        assert_eq!(tick.quote, Some(Quote { bid: 2450.4, ask: 2450.55 }));
        assert_eq!(tick.kind, InstrumentKind::Market);

        let FeedMessage::CandleClosed(candle) = &messages[2] else { panic!("expected candle") };
        assert_eq!(candle.timeframe, 1);
        assert_eq!(candle.volume, 5400.0);
        assert_eq!(candle.ts_ms, 1_741_582_740_000);
    }

    #[test]
    fn test_index_snapshot_has_no_book() {
        let line = r#"{"feeds": {"NSE_INDEX|Nifty 50": {"fullFeed": {"indexFF": {
            "ltpc": {"ltp": 22500.15, "ltt": 1741582800000},
            "marketOHLC": {"ohlc": [{"interval": "I1", "open": 22490, "high": 22510, "low": 22480, "close": 22500, "ts": 1741582740000}]}
        }}}}}"#;
        let messages = FeedMessage::parse_line(line).unwrap();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            FeedMessage::Tick(t) => {
                assert_eq!(t.kind, InstrumentKind::Index);
                assert_eq!(t.qty, 0);
                assert!(t.quote.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match &messages[1] {
            FeedMessage::CandleClosed(c) => {
                assert_eq!(c.kind, InstrumentKind::Index);
                assert_eq!(c.volume, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_payloads_are_skipped_not_fatal() {
        let line = r#"{"feeds": {"A": {"fullFeed": {"marketFF": {"ltpc": {"ltp": "0"}}}}, "B": {}}}"#;
        assert!(FeedMessage::parse_line(line).unwrap().is_empty());
        assert!(matches!(FeedMessage::parse_line("{not json"), Err(EngineError::Feed(_))));
    }

    #[test]
    fn test_tagged_messages_pass_through() {
        let line = r#"{"type": "CandleClosed", "symbol": "X", "open": 1, "high": 2, "low": 0.5, "close": 1.5, "volume": 10, "ts_ms": 60000}"#;
        let messages = FeedMessage::parse_line(line).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].symbol(), "X");
        assert!(matches!(&messages[0], FeedMessage::CandleClosed(c) if c.timeframe == 1));

        let tick = r#"{"type": "Tick", "symbol": "X", "price": 10.5, "qty": 3, "ts_ms": 1}"#;
        assert!(matches!(&FeedMessage::parse_line(tick).unwrap()[0], FeedMessage::Tick(t) if t.qty == 3));
    }
}
