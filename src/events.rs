//! Downstream events
//!
//! Published on a `tokio::sync::broadcast` channel. Delivery is at least
//! once from the consumer's point of view: a replayed trade write may repeat
//! an event, and a lagging receiver may miss some.

use serde::Serialize;
use uuid::Uuid;

use crate::trading_core::footprint::FootprintBar;
use crate::trading_core::trades::{ExitReason, Trade};
use crate::types::Side;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    FootprintClosed(FootprintBar),
    TradeOpened(Trade),
    TradeClosed(Trade),
    StopUpdated {
        symbol: String,
        trade_id: Uuid,
        stop: f64,
        ts_ms: i64,
    },
    AddOn {
        symbol: String,
        trade_id: Uuid,
        price: f64,
        count: u32,
        ts_ms: i64,
    },
    /// A trade-state write exhausted its retries and was queued
    PersistenceDegraded { symbol: String, pending: usize },
}

/// Decision returned to the caller for a processed message
#[derive(Debug, Clone, PartialEq)]
pub enum TradeAction {
    Enter {
        symbol: String,
        side: Side,
        price: f64,
        stop: f64,
        target: f64,
    },
    Exit {
        symbol: String,
        side: Side,
        price: f64,
        pnl: f64,
        reason: ExitReason,
    },
    UpdateStop { symbol: String, new_stop: f64 },
    AddOn { symbol: String, side: Side, price: f64, count: u32 },
}

impl EngineEvent {
    /// Symbol the event belongs to
    pub fn symbol(&self) -> &str {
        match self {
            EngineEvent::FootprintClosed(bar) => &bar.symbol,
            EngineEvent::TradeOpened(t) | EngineEvent::TradeClosed(t) => &t.symbol,
            EngineEvent::StopUpdated { symbol, .. }
            | EngineEvent::AddOn { symbol, .. }
            | EngineEvent::PersistenceDegraded { symbol, .. } => symbol,
        }
    }
}
