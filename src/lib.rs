// Library crate - exports the decision engine, feed normalization and persistence

pub mod types;
pub mod config;
pub mod error;
pub mod feed;
pub mod events;
pub mod trading_core;
pub mod persistence;
pub mod dispatch;
pub mod journal;

// Re-export commonly used types
pub use config::EngineConfig;
pub use dispatch::{Dispatcher, WorkerReport};
pub use error::EngineError;
pub use events::{EngineEvent, TradeAction};
pub use feed::FeedMessage;
pub use trading_core::DecisionEngine;
