//! Trading Core - order-flow aggregation and trade-lifecycle decisions
//!
//! - Trade side inference and footprint aggregation
//! - ATR, volume profile and auction regime
//! - Higher-timeframe bias, order book and pressure analysis
//! - Signal detection, stop/target logic and entry guards
//! - The per-symbol decision engine tying them together

pub mod inference;
pub mod footprint;
pub mod atr;
pub mod volume_profile;
pub mod timeframe;
pub mod orderbook;
pub mod pressure;
pub mod signals;
pub mod stops;
pub mod guards;
pub mod trades;
pub mod engine;

// Re-export commonly used types
pub use engine::DecisionEngine;
pub use footprint::{FootprintBar, FootprintBuilder};
pub use trades::{EntryKind, ExitReason, StructureLevel, Trade, TradeStatus};
