// =============================================================================
// Trade Ingestor - glue between the feed, the aggregator and downstream stages
// =============================================================================

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::market_data::aggregator::CandleAggregator;
use crate::store::CandleStore;
use crate::types::{Candle, CandleUpdate, TradeEvent};

/// Owned by the feed task. Dropping it closes the update channel, which is how
/// the broadcast coordinator learns that ingestion has stopped.
pub struct TradeIngestor {
    aggregator: Arc<CandleAggregator>,
    store: Arc<dyn CandleStore>,
    updates: mpsc::UnboundedSender<CandleUpdate>,
    retention_trigger: Arc<Notify>,
}

impl TradeIngestor {
    pub fn new(
        aggregator: Arc<CandleAggregator>,
        store: Arc<dyn CandleStore>,
        updates: mpsc::UnboundedSender<CandleUpdate>,
        retention_trigger: Arc<Notify>,
    ) -> Self {
        Self {
            aggregator,
            store,
            updates,
            retention_trigger,
        }
    }

    /// Feed one trade through the aggregator and forward what it produced.
    pub fn ingest(&self, trade: &TradeEvent) {
        for update in self.aggregator.ingest(trade) {
            if update.is_closed() {
                self.persist(update.candle.clone());
            }
            if self.updates.send(update).is_err() {
                debug!(symbol = %trade.symbol, "broadcast coordinator gone, update dropped");
            }
        }
    }

    /// Handle every trade carried by one feed message, then nudge the
    /// retention task. Called once per decoded message, trade or not.
    pub fn ingest_batch(&self, trades: &[TradeEvent]) {
        for trade in trades {
            self.ingest(trade);
        }
        self.retention_trigger.notify_one();
    }

    /// Hand a finalized candle to the store without blocking aggregation.
    fn persist(&self, candle: Candle) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save(&candle).await {
                warn!(
                    symbol = %candle.symbol,
                    timestamp = %candle.timestamp,
                    error = %e,
                    "failed to save finalized candle"
                );
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::feed::parse_feed_message;
    use crate::store::memory::MemoryCandleStore;
    use crate::types::UpdateKind;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use std::time::Duration;

    fn trade(price: f64, secs: i64) -> TradeEvent {
        TradeEvent::new("AAPL", price, 1.0, Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn setup() -> (
        TradeIngestor,
        mpsc::UnboundedReceiver<CandleUpdate>,
        Arc<MemoryCandleStore>,
        Arc<Notify>,
    ) {
        let aggregator = Arc::new(CandleAggregator::new(TimeDelta::seconds(60)).unwrap());
        let store = Arc::new(MemoryCandleStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let trigger = Arc::new(Notify::new());
        let ingestor = TradeIngestor::new(aggregator, store.clone(), tx, trigger.clone());
        (ingestor, rx, store, trigger)
    }

    #[tokio::test]
    async fn closed_precedes_live_and_is_persisted() {
        let (ingestor, mut rx, store, _trigger) = setup();

        ingestor.ingest_batch(&[trade(100.0, 0), trade(105.0, 10), trade(95.0, 70)]);

        let kinds: Vec<UpdateKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|u| u.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![UpdateKind::Live, UpdateKind::Live, UpdateKind::Closed, UpdateKind::Live]
        );

        // The save runs on a detached task.
        for _ in 0..50 {
            if !store.candles(None).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let saved = store.candles(Some("AAPL")).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].open, 100.0);
        assert_eq!(saved[0].close, 105.0);
    }

    #[tokio::test]
    async fn every_batch_triggers_retention() {
        let (ingestor, _rx, _store, trigger) = setup();
        ingestor.ingest_batch(&[]);
        tokio::time::timeout(Duration::from_millis(100), trigger.notified())
            .await
            .expect("retention should have been notified");
    }

    #[tokio::test]
    async fn out_of_range_timestamp_does_not_stop_ingestion() {
        let (ingestor, mut rx, _store, _trigger) = setup();
        ingestor.ingest(&trade(100.0, 0));
        assert!(rx.try_recv().is_ok());

        let last_ms = DateTime::<Utc>::MAX_UTC.timestamp_millis() - 1000;
        let frame = format!(
            r#"{{"type":"trade","data":[{{"s":"AAPL","p":1.0,"v":1,"t":{last_ms}}}]}}"#
        );
        let trades = parse_feed_message(&frame).unwrap();
        assert_eq!(trades.len(), 1);

        ingestor.ingest_batch(&trades);
        assert!(rx.try_recv().is_err(), "unrepresentable window yields no update");

        ingestor.ingest_batch(&[trade(102.0, 5)]);
        let update = rx.try_recv().expect("ingestion keeps going");
        assert_eq!(update.kind, UpdateKind::Live);
        assert_eq!((update.candle.open, update.candle.close), (100.0, 102.0));
    }

    #[tokio::test]
    async fn closed_coordinator_does_not_stop_ingestion() {
        let (ingestor, rx, _store, _trigger) = setup();
        drop(rx);
        ingestor.ingest(&trade(100.0, 0));
        ingestor.ingest(&trade(101.0, 61));
        assert_eq!(ingestor.aggregator.snapshot("AAPL").unwrap().open, 101.0);
    }
}
