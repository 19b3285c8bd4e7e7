//! Ticker-related models

use serde::Serialize;

/// Most feed titles ever kept.
pub const MAX_TICKER_ITEMS: usize = 20;

/// Feed titles as of the last successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickerSnapshot {
    /// Document order, at most [`MAX_TICKER_ITEMS`]
    pub items: Vec<String>,
    /// Epoch seconds of the last successful refresh; 0 if never
    pub fetched_at: i64,
}
