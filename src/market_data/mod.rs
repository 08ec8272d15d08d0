pub mod aggregator;
pub mod feed;
pub mod ingest;

pub use aggregator::CandleAggregator;
pub use feed::{run_feed_with_backoff, Backoff};
pub use ingest::TradeIngestor;
