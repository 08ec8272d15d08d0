// =============================================================================
// Candle Store - persistence boundary for finalized candles
// =============================================================================
//
// The aggregation core never assumes exclusive access to the store: every
// operation is individually atomic and the store does its own locking.
// =============================================================================

pub mod memory;
pub mod retention;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Candle;

pub use memory::MemoryCandleStore;
pub use sqlite::SqliteCandleStore;

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Persist one finalized candle.
    async fn save(&self, candle: &Candle) -> Result<()>;

    /// Remove every candle whose timestamp is strictly before `cutoff`.
    /// Returns the number of candles removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// All stored candles ordered by timestamp ascending, optionally limited
    /// to a single symbol.
    async fn candles(&self, symbol: Option<&str>) -> Result<Vec<Candle>>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}
