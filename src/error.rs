use thiserror::Error;

use crate::persistence::StoreError;

/// Failures surfaced by the decision engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or partial feed payload; the message is skipped
    #[error("feed error: {0}")]
    Feed(String),

    /// An operation would break an engine invariant; prior state is kept
    #[error("invariant violation for {symbol}: {detail}")]
    Invariant { symbol: String, detail: String },

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn invariant(symbol: &str, detail: impl Into<String>) -> Self {
        Self::Invariant {
            symbol: symbol.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Feed(e.to_string())
    }
}
