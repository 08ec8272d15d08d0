use std::collections::HashMap;

use anyhow::{ensure, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::{Candle, CandleUpdate, TradeEvent};

// ---------------------------------------------------------------------------
// In-progress candle
// ---------------------------------------------------------------------------

/// The open window for a single symbol.
///
/// Only ever touched while the aggregator's table lock is held.
#[derive(Debug, Clone)]
struct InProgressCandle {
    symbol: String,
    open_time: DateTime<Utc>,
    close_time: DateTime<Utc>,
    open: f64,
    close: f64,
    high: f64,
    low: f64,
    volume: f64,
}

impl InProgressCandle {
    /// `None` when the window would end past the representable range.
    fn open(trade: &TradeEvent, window: TimeDelta) -> Option<Self> {
        let close_time = trade.timestamp.checked_add_signed(window)?;
        Some(Self {
            symbol: trade.symbol.clone(),
            open_time: trade.timestamp,
            close_time,
            open: trade.price,
            close: trade.price,
            high: trade.price,
            low: trade.price,
            volume: 0.0,
        })
    }

    /// Trades stamped before `open_time` still land in this window.
    fn apply(&mut self, trade: &TradeEvent) {
        self.close = trade.price;
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.volume += trade.size;
    }

    /// A trade exactly on the boundary belongs to the next window.
    fn is_expired_by(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.close_time
    }

    fn to_candle(&self) -> Candle {
        Candle {
            symbol: self.symbol.clone(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            timestamp: self.close_time,
        }
    }
}

// ---------------------------------------------------------------------------
// CandleAggregator -- one lock over the whole symbol table
// ---------------------------------------------------------------------------

/// Turns trades into candle updates, one fixed-length window per symbol.
///
/// Every call to [`ingest`](Self::ingest) runs under a single mutex scoped to
/// the whole symbol table, so a symbol's `Closed` update for window N is always
/// produced before any `Live` update for window N+1.
pub struct CandleAggregator {
    candles: Mutex<HashMap<String, InProgressCandle>>,
    window: TimeDelta,
}

impl CandleAggregator {
    pub fn new(window: TimeDelta) -> Result<Self> {
        ensure!(window > TimeDelta::zero(), "candle window must be positive, got {window}");
        Ok(Self {
            candles: Mutex::new(HashMap::new()),
            window,
        })
    }

    /// Apply a trade and return the updates it produced, in emission order.
    ///
    /// * Always ends with exactly one `Live` update for the trade's symbol.
    /// * Is preceded by one `Closed` update when the trade crossed the close
    ///   boundary of the symbol's open window.
    ///
    /// A trade whose window cannot be represented is skipped and produces
    /// nothing; the symbol's open candle is left as it was.
    pub fn ingest(&self, trade: &TradeEvent) -> Vec<CandleUpdate> {
        let mut updates = Vec::with_capacity(2);
        let mut table = self.candles.lock();

        let expired = table
            .get(&trade.symbol)
            .map_or(true, |c| c.is_expired_by(trade.timestamp));

        if expired {
            let Some(fresh) = InProgressCandle::open(trade, self.window) else {
                warn!(
                    symbol = %trade.symbol,
                    timestamp = %trade.timestamp,
                    "trade timestamp out of range, skipping"
                );
                return updates;
            };
            if let Some(previous) = table.insert(trade.symbol.clone(), fresh) {
                let finalized = previous.to_candle();
                debug!(
                    symbol = %finalized.symbol,
                    open_time = %previous.open_time,
                    close_time = %finalized.timestamp,
                    close = finalized.close,
                    "candle window closed"
                );
                updates.push(CandleUpdate::closed(finalized));
            }
        }

        if let Some(candle) = table.get_mut(&trade.symbol) {
            candle.apply(trade);
            updates.push(CandleUpdate::live(candle.to_candle()));
        }

        updates
    }

    /// Snapshot of the open candle for `symbol`, if any.
    pub fn snapshot(&self, symbol: &str) -> Option<Candle> {
        self.candles.lock().get(symbol).map(InProgressCandle::to_candle)
    }

    /// Snapshots of every open candle, sorted by symbol.
    pub fn snapshots(&self) -> Vec<Candle> {
        let mut all: Vec<Candle> = self
            .candles
            .lock()
            .values()
            .map(InProgressCandle::to_candle)
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
