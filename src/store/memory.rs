use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::store::CandleStore;
use crate::types::Candle;

/// Process-local store, used when no database path is configured.
#[derive(Default)]
pub struct MemoryCandleStore {
    candles: RwLock<Vec<Candle>>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn save(&self, candle: &Candle) -> Result<()> {
        self.candles.write().push(candle.clone());
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut candles = self.candles.write();
        let before = candles.len();
        candles.retain(|c| c.timestamp >= cutoff);
        Ok(before - candles.len())
    }

    async fn candles(&self, symbol: Option<&str>) -> Result<Vec<Candle>> {
        let mut out: Vec<Candle> = self
            .candles
            .read()
            .iter()
            .filter(|c| symbol.map_or(true, |s| c.symbol == s))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.timestamp);
        Ok(out)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(symbol: &str, secs: i64) -> Candle {
        Candle {
            symbol: symbol.into(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn query_is_sorted_and_filtered() {
        let store = MemoryCandleStore::new();
        store.save(&candle("AAPL", 180)).await.unwrap();
        store.save(&candle("AMZN", 60)).await.unwrap();
        store.save(&candle("AAPL", 120)).await.unwrap();

        let all = store.candles(None).await.unwrap();
        let stamps: Vec<i64> = all.iter().map(|c| c.timestamp.timestamp()).collect();
        assert_eq!(stamps, vec![60, 120, 180]);

        let aapl = store.candles(Some("AAPL")).await.unwrap();
        assert_eq!(aapl.len(), 2);
        assert!(aapl.iter().all(|c| c.symbol == "AAPL"));
    }

    #[tokio::test]
    async fn delete_older_than_is_strict() {
        let store = MemoryCandleStore::new();
        for secs in [60, 120, 180] {
            store.save(&candle("AAPL", secs)).await.unwrap();
        }

        let removed = store
            .delete_older_than(Utc.timestamp_opt(120, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.candles(None).await.unwrap().len(), 2);
    }
}
