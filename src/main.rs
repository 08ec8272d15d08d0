// =============================================================================
// Candle Relay - Main Entry Point
// =============================================================================
//
// Trades from the feed are aggregated into per-symbol candles, finalized
// candles are persisted, and updates are pushed to WebSocket subscribers.
//
//   feed ─▶ ingestor ─▶ aggregator ─▶ coordinator ─▶ router ─▶ consumers
//                  └──▶ store ◀── retention trim
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod market_data;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broadcast::BroadcastCoordinator;
use crate::market_data::{run_feed_with_backoff, Backoff, TradeIngestor};
use crate::runtime_config::RuntimeConfig;
use crate::store::retention::run_retention_loop;
use crate::store::{CandleStore, MemoryCandleStore, SqliteCandleStore};

/// How long shutdown waits for each background task to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Relay starting up");

    let config_path =
        std::env::var("CANDLE_CONFIG").unwrap_or_else(|_| "candle_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|key| std::env::var(key).ok());
    config.validate().context("invalid configuration")?;

    if config.api_key.is_empty() {
        bail!("API_KEY is not set; the trade feed requires a token");
    }

    info!(
        symbols = ?config.symbols,
        window_secs = config.window_secs,
        coalesce_interval_ms = config.coalesce_interval_ms,
        coalesce_mode = %config.coalesce_mode,
        retention_minutes = config.retention_minutes,
        "Configuration resolved"
    );

    // ── 2. Candle store ──────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = match &config.store_path {
        Some(path) => Arc::new(SqliteCandleStore::open(path)?),
        None => Arc::new(MemoryCandleStore::new()),
    };
    info!(backend = store.backend_type(), "Candle store ready");

    // ── 3. Shared state & channels ───────────────────────────────────────
    let state = Arc::new(AppState::new(config.clone(), store.clone())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let retention_trigger = Arc::new(Notify::new());

    // ── 4. Broadcast coordinator ─────────────────────────────────────────
    let coordinator = BroadcastCoordinator::new(
        state.router.clone(),
        config.coalesce_interval(),
        config.coalesce_mode,
    );
    let coordinator_handle = tokio::spawn(coordinator.run(update_rx));

    // ── 5. Retention trim ────────────────────────────────────────────────
    let retention_handle = tokio::spawn(run_retention_loop(
        store.clone(),
        config.retention(),
        retention_trigger.clone(),
        shutdown_rx.clone(),
    ));

    // ── 6. Trade feed ────────────────────────────────────────────────────
    let ingestor = TradeIngestor::new(
        state.aggregator.clone(),
        store.clone(),
        update_tx,
        retention_trigger,
    );
    let feed_handle = tokio::spawn(run_feed_with_backoff(
        config.feed_endpoint(),
        config.symbols.clone(),
        ingestor,
        Backoff::new(config.reconnect_initial(), config.reconnect_max()),
        shutdown_rx.clone(),
    ));

    // ── 7. HTTP / WebSocket server ───────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received - stopping gracefully");
    let _ = shutdown_tx.send(true);

    // The feed owns the update sender; once it returns the coordinator sees
    // a closed channel and exits on its own.
    for (name, handle) in [
        ("feed", feed_handle),
        ("coordinator", coordinator_handle),
        ("retention", retention_handle),
        ("server", server_handle),
    ] {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "task panicked"),
            Err(_) => warn!(task = name, "task did not stop in time"),
        }
    }

    info!("Candle Relay shut down complete.");
    Ok(())
}
