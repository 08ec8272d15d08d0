// =============================================================================
// Retention Trim - keeps the store to a rolling window
// =============================================================================
//
// The ingestor pokes `trigger` once per feed message. `Notify` keeps at most one
// pending permit, so a burst of messages collapses into a single trim and the
// feed task never waits on the store.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::store::CandleStore;

/// Drop everything older than `now - retention`.
pub async fn trim_once(
    store: &dyn CandleStore,
    retention: TimeDelta,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cutoff = now - retention;
    let removed = store.delete_older_than(cutoff).await?;
    if removed > 0 {
        debug!(removed, cutoff = %cutoff, backend = store.backend_type(), "expired candles trimmed");
    }
    Ok(removed)
}

pub async fn run_retention_loop(
    store: Arc<dyn CandleStore>,
    retention: TimeDelta,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(retention_minutes = retention.num_minutes(), "retention loop started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = trigger.notified() => {
                if let Err(e) = trim_once(store.as_ref(), retention, Utc::now()).await {
                    warn!(error = %e, "retention trim failed");
                }
            }
        }
    }

    info!("retention loop stopped");
}
