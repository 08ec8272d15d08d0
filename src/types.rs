// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single executed trade received from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

impl TradeEvent {
    pub fn new(symbol: impl Into<String>, price: f64, size: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            size,
            timestamp,
        }
    }

    /// A trade is usable when its price is positive and finite and its size is
    /// a non-negative finite quantity.
    pub fn is_valid(&self) -> bool {
        !self.symbol.is_empty()
            && self.price.is_finite()
            && self.price > 0.0
            && self.size.is_finite()
            && self.size >= 0.0
    }
}

/// A finalized (or snapshotted) OHLC candle.
///
/// `timestamp` is the close boundary of the candle's window. Volume is kept
/// in-process and in the store but is not part of the public wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip)]
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Whether an update describes a still-open window or a just-finalized one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "closes")]
    Closed,
}

/// Message pushed from the aggregator towards subscribed consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub candle: Candle,
}

impl CandleUpdate {
    pub fn live(candle: Candle) -> Self {
        Self {
            kind: UpdateKind::Live,
            candle,
        }
    }

    pub fn closed(candle: Candle) -> Self {
        Self {
            kind: UpdateKind::Closed,
            candle,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.candle.symbol
    }

    pub fn is_closed(&self) -> bool {
        self.kind == UpdateKind::Closed
    }
}

// =============================================================================
// Tests
// =============================================================================
