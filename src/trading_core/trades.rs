//! Trade lifecycle records and remembered structure levels

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// Why a trade was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    /// Initial stop hit
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TP")]
    TakeProfit,
    /// Tightened (trailed) stop hit
    VolStop,
    #[serde(rename = "OB_WALL_DETECTED")]
    OrderBookWall,
    ExhaustionAggression,
    CandleHlBreak,
}

impl ExitReason {
    /// Reasons that start the post-stop cooldown
    pub fn is_stop_type(self) -> bool {
        matches!(
            self,
            ExitReason::StopLoss
                | ExitReason::VolStop
                | ExitReason::ExhaustionAggression
                | ExitReason::CandleHlBreak
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "SL",
            ExitReason::TakeProfit => "TP",
            ExitReason::VolStop => "VOL_STOP",
            ExitReason::OrderBookWall => "OB_WALL_DETECTED",
            ExitReason::ExhaustionAggression => "EXHAUSTION_AGGRESSION",
            ExitReason::CandleHlBreak => "CANDLE_HL_BREAK",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the entry was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    #[default]
    Standard,
    Igniting,
}

/// One position lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_ts: i64,
    pub stop_price: f64,
    /// Stop at entry; trailing only ever moves `stop_price` away from it
    pub initial_stop: f64,
    pub take_profit_price: f64,
    #[serde(default)]
    pub entry_kind: EntryKind,
    /// Most favourable price seen since entry (chandelier anchor)
    pub best_price: f64,
    #[serde(default)]
    pub adds: u32,
    pub exit_price: Option<f64>,
    pub exit_ts: Option<i64>,
    pub reason: Option<ExitReason>,
    pub pnl: Option<f64>,
    pub status: TradeStatus,
}

impl Trade {
    pub fn open(
        symbol: &str,
        side: Side,
        entry_price: f64,
        entry_ts: i64,
        stop_price: f64,
        take_profit_price: f64,
        entry_kind: EntryKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            entry_ts,
            stop_price,
            initial_stop: stop_price,
            take_profit_price,
            entry_kind,
            best_price: entry_price,
            adds: 0,
            exit_price: None,
            exit_ts: None,
            reason: None,
            pnl: None,
            status: TradeStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Signed points gained at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign()
    }

    /// Fractional move in the trade's favour at `price`
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        self.pnl_at(price) / self.entry_price
    }

    pub fn stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price <= self.stop_price,
            Side::Short => price >= self.stop_price,
        }
    }

    pub fn target_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price >= self.take_profit_price,
            Side::Short => price <= self.take_profit_price,
        }
    }

    /// True once trailing or hardening moved the stop off its initial value
    pub fn stop_tightened(&self) -> bool {
        match self.side {
            Side::Long => self.stop_price > self.initial_stop,
            Side::Short => self.stop_price < self.initial_stop,
        }
    }

    /// Move the stop only in the profitable direction. Returns true if it moved.
    pub fn tighten_stop(&mut self, candidate: f64) -> bool {
        let tighter = match self.side {
            Side::Long => candidate > self.stop_price,
            Side::Short => candidate < self.stop_price,
        };
        if tighter {
            self.stop_price = candidate;
        }
        tighter
    }

    /// Track the most favourable price for the chandelier anchor
    pub fn mark_price(&mut self, price: f64) {
        self.best_price = match self.side {
            Side::Long => self.best_price.max(price),
            Side::Short => self.best_price.min(price),
        };
    }

    /// Terminal transition; closed trades are never mutated afterwards
    pub fn close(&mut self, price: f64, ts: i64, reason: ExitReason) {
        self.exit_price = Some(price);
        self.exit_ts = Some(ts);
        self.reason = Some(reason);
        self.pnl = Some(self.pnl_at(price));
        self.status = TradeStatus::Closed;
    }
}

/// A remembered support/resistance price, unique per (symbol, price, side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureLevel {
    pub symbol: String,
    pub price: f64,
    pub side: Side,
    pub created_ts: i64,
    pub last_used_ts: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_only_tightens() {
        let mut trade = Trade::open("X", Side::Long, 100.0, 0, 97.5, 107.5, EntryKind::Standard);
        assert!(trade.tighten_stop(98.0));
        assert!(!trade.tighten_stop(97.0));
        assert_eq!(trade.stop_price, 98.0);
        assert!(trade.stop_tightened());

        let mut short = Trade::open("X", Side::Short, 100.0, 0, 102.5, 92.5, EntryKind::Standard);
        assert!(short.tighten_stop(101.0));
        assert!(!short.tighten_stop(103.0));
        assert_eq!(short.stop_price, 101.0);
    }

    #[test]
    fn test_close_records_pnl() {
        let mut trade = Trade::open("X", Side::Short, 100.0, 0, 102.5, 92.5, EntryKind::Standard);
        trade.close(98.0, 1_000, ExitReason::TakeProfit);
        assert_eq!(trade.pnl, Some(2.0));
        assert_eq!(trade.status, TradeStatus::Closed);
        assert!(!trade.is_open());
    }

    #[test]
    fn test_exit_reason_wire_names() {
        assert_eq!(serde_json::to_string(&ExitReason::StopLoss).unwrap(), "\"SL\"");
        assert_eq!(
            serde_json::to_string(&ExitReason::OrderBookWall).unwrap(),
            "\"OB_WALL_DETECTED\""
        );
        assert_eq!(
            serde_json::to_string(&ExitReason::ExhaustionAggression).unwrap(),
            "\"EXHAUSTION_AGGRESSION\""
        );
        assert!(ExitReason::VolStop.is_stop_type());
        assert!(!ExitReason::TakeProfit.is_stop_type());
    }
}
