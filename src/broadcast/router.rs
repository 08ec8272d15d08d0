// =============================================================================
// Fan-out Router - subscription registry and filtered delivery
// =============================================================================
//
// Each connected consumer owns a bounded outbound queue drained by its own
// writer task. Delivery only ever `try_send`s into those queues, so it never
// waits on a socket. A closed queue (writer gone) or a full one (writer stuck
// behind a slow peer) counts as a failed send and prunes the consumer.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::CandleUpdate;

/// Serialized frame shared by every recipient of one update.
pub type Frame = Arc<str>;

/// Outbound half of a consumer's queue, plus the signal raised when the
/// router drops the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSink {
    queue: mpsc::Sender<Frame>,
    evicted: Arc<Notify>,
}

impl ConsumerSink {
    pub fn new(queue: mpsc::Sender<Frame>) -> Self {
        Self {
            queue,
            evicted: Arc::new(Notify::new()),
        }
    }

    /// Resolves once the router has pruned this consumer. An eviction that
    /// happens while nobody is waiting is kept until the next call.
    pub async fn evicted(&self) {
        self.evicted.notified().await
    }

    fn evict(&self) {
        self.evicted.notify_one();
    }
}

impl From<mpsc::Sender<Frame>> for ConsumerSink {
    fn from(queue: mpsc::Sender<Frame>) -> Self {
        Self::new(queue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscription {
    symbol: String,
    sink: ConsumerSink,
}

#[derive(Default)]
pub struct FanoutRouter {
    subscriptions: Mutex<HashMap<ConsumerId, Subscription>>,
}

impl FanoutRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` for `symbol`, replacing any earlier subscription.
    pub fn subscribe(
        &self,
        consumer: ConsumerId,
        symbol: impl Into<String>,
        sink: impl Into<ConsumerSink>,
    ) {
        let symbol = symbol.into();
        let sink = sink.into();
        let previous = self
            .subscriptions
            .lock()
            .insert(consumer, Subscription { symbol: symbol.clone(), sink });

        match previous {
            Some(old) if old.symbol != symbol => {
                info!(consumer = %consumer, from = %old.symbol, to = %symbol, "consumer switched symbol")
            }
            Some(_) => {}
            None => info!(consumer = %consumer, symbol = %symbol, "consumer subscribed"),
        }
    }

    /// Returns `true` if the consumer was registered.
    pub fn unsubscribe(&self, consumer: ConsumerId) -> bool {
        let removed = self.subscriptions.lock().remove(&consumer).is_some();
        if removed {
            info!(consumer = %consumer, "consumer unsubscribed");
        }
        removed
    }

    /// Send `update` to every consumer subscribed to its symbol.
    ///
    /// Returns the number of consumers the frame was queued for. Consumers
    /// whose queue rejects the frame are removed and evicted; the rest still
    /// receive it.
    pub fn deliver(&self, update: &CandleUpdate) -> usize {
        let frame: Frame = match serde_json::to_string(update) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(error = %e, symbol = %update.symbol(), "failed to serialize candle update");
                return 0;
            }
        };

        let mut subscriptions = self.subscriptions.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, sub) in subscriptions.iter() {
            if sub.symbol != update.symbol() {
                continue;
            }
            match sub.sink.queue.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Closed(_)) => {
                    debug!(consumer = %id, "consumer queue closed");
                    dead.push(*id);
                }
                Err(TrySendError::Full(_)) => {
                    warn!(consumer = %id, symbol = %sub.symbol, "consumer queue full, dropping consumer");
                    dead.push(*id);
                }
            }
        }

        for id in &dead {
            if let Some(sub) = subscriptions.remove(id) {
                sub.sink.evict();
            }
        }
        if !dead.is_empty() {
            info!(removed = dead.len(), remaining = subscriptions.len(), "pruned dead consumers");
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, consumer: ConsumerId) -> bool {
        self.subscriptions.lock().contains_key(&consumer)
    }
}

// =============================================================================
// Tests
// =============================================================================
