// =============================================================================
// Broadcast Coordinator - rate-limits live updates, passes closes through
// =============================================================================
//
// Single task, two wake-up sources:
//   1. an update arrives from the ingestor (unbounded channel, never blocks
//      the feed task),
//   2. the coalescing timer ticks.
//
// `Closed` updates go straight to the router. `Live` updates park in a pending
// slot and only the newest one present at tick time is delivered.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::broadcast::router::FanoutRouter;
use crate::types::CandleUpdate;

/// How pending `Live` updates are coalesced between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalesceMode {
    /// One slot for the whole process: a burst across several symbols
    /// delivers only the last symbol's live candle for that interval.
    #[default]
    Process,
    /// One slot per symbol: every symbol with activity gets one live
    /// candle per interval.
    PerSymbol,
}

impl std::fmt::Display for CoalesceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::PerSymbol => write!(f, "per_symbol"),
        }
    }
}

enum PendingLive {
    Single(Option<CandleUpdate>),
    PerSymbol(BTreeMap<String, CandleUpdate>),
}

impl PendingLive {
    fn new(mode: CoalesceMode) -> Self {
        match mode {
            CoalesceMode::Process => Self::Single(None),
            CoalesceMode::PerSymbol => Self::PerSymbol(BTreeMap::new()),
        }
    }

    /// Park `update`, superseding whatever it replaces.
    fn offer(&mut self, update: CandleUpdate) {
        match self {
            Self::Single(slot) => *slot = Some(update),
            Self::PerSymbol(table) => {
                table.insert(update.symbol().to_string(), update);
            }
        }
    }

    /// Forget a pending live candle for `symbol`; its window just closed.
    fn discard(&mut self, symbol: &str) {
        match self {
            Self::Single(slot) => {
                if slot.as_ref().is_some_and(|u| u.symbol() == symbol) {
                    *slot = None;
                }
            }
            Self::PerSymbol(table) => {
                table.remove(symbol);
            }
        }
    }

    fn take(&mut self) -> Vec<CandleUpdate> {
        match self {
            Self::Single(slot) => slot.take().into_iter().collect(),
            Self::PerSymbol(table) => std::mem::take(table).into_values().collect(),
        }
    }
}

pub struct BroadcastCoordinator {
    router: Arc<FanoutRouter>,
    interval: Duration,
    pending: PendingLive,
}

impl BroadcastCoordinator {
    pub fn new(router: Arc<FanoutRouter>, interval: Duration, mode: CoalesceMode) -> Self {
        Self {
            router,
            interval,
            pending: PendingLive::new(mode),
        }
    }

    /// Run until the update channel closes, then flush what is pending.
    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<CandleUpdate>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "broadcast coordinator started");

        loop {
            tokio::select! {
                // Ticks first so a flood of updates cannot starve the flush.
                biased;

                _ = ticker.tick() => self.flush(),
                maybe = updates.recv() => match maybe {
                    Some(update) => self.accept(update),
                    None => break,
                },
            }
        }

        self.flush();
        info!("broadcast coordinator stopped");
    }

    fn accept(&mut self, update: CandleUpdate) {
        if update.is_closed() {
            self.pending.discard(update.symbol());
            let delivered = self.router.deliver(&update);
            debug!(symbol = %update.symbol(), delivered, "closed candle broadcast");
        } else {
            self.pending.offer(update);
        }
    }

    fn flush(&mut self) {
        for update in self.pending.take() {
            let delivered = self.router.deliver(&update);
            debug!(symbol = %update.symbol(), delivered, "live candle broadcast");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
