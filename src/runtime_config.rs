// =============================================================================
// Runtime Configuration - service settings loaded at startup
// =============================================================================
//
// Every field carries a serde default so that a partial (or missing) JSON file
// still yields a complete configuration. Secrets never live in the file: the
// feed token comes from the environment only.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broadcast::CoalesceMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["AAPL".to_string(), "AMZN".to_string()]
}

fn default_window_secs() -> u64 {
    60
}

fn default_coalesce_interval_ms() -> u64 {
    500
}

fn default_retention_minutes() -> u64 {
    20
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_consumer_queue_capacity() -> usize {
    64
}

fn default_consumer_write_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ---------------------------------------------------------------

    /// Symbols subscribed on the trade feed.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Base URL of the trade WebSocket; the token is appended as `?token=`.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Feed API token. Environment only (`API_KEY`).
    #[serde(skip)]
    pub api_key: String,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    // --- Aggregation --------------------------------------------------------

    /// Candle window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    // --- Broadcast ----------------------------------------------------------

    /// At most one live delivery per interval (per symbol in `per_symbol`).
    #[serde(default = "default_coalesce_interval_ms")]
    pub coalesce_interval_ms: u64,

    #[serde(default)]
    pub coalesce_mode: CoalesceMode,

    /// Outbound frames buffered per consumer before it is considered stuck.
    #[serde(default = "default_consumer_queue_capacity")]
    pub consumer_queue_capacity: usize,

    /// Upper bound on a single WebSocket write to a consumer.
    #[serde(default = "default_consumer_write_timeout_ms")]
    pub consumer_write_timeout_ms: u64,

    // --- Storage ------------------------------------------------------------

    /// SQLite database path. `None` keeps candles in memory.
    #[serde(default)]
    pub store_path: Option<String>,

    /// Finalized candles older than this are trimmed.
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: u64,

    // --- Server -------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            feed_url: default_feed_url(),
            api_key: String::new(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            window_secs: default_window_secs(),
            coalesce_interval_ms: default_coalesce_interval_ms(),
            coalesce_mode: CoalesceMode::default(),
            consumer_queue_capacity: default_consumer_queue_capacity(),
            consumer_write_timeout_ms: default_consumer_write_timeout_ms(),
            store_path: None,
            retention_minutes: default_retention_minutes(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            window_secs = config.window_secs,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = var("API_KEY") {
            self.api_key = key.trim().to_string();
        }
        if let Some(syms) = var("SYMBOLS") {
            let symbols: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Some(port) = var("SERVER_PORT") {
            let port = port.trim();
            if !port.is_empty() {
                self.bind_addr = format!("0.0.0.0:{port}");
            }
        }
        if let Some(path) = var("CANDLE_DB_PATH") {
            let path = path.trim();
            self.store_path = (!path.is_empty()).then(|| path.to_string());
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbols.is_empty(), "at least one symbol must be configured");
        ensure!(self.window_secs > 0, "window_secs must be positive");
        ensure!(self.coalesce_interval_ms > 0, "coalesce_interval_ms must be positive");
        ensure!(self.consumer_queue_capacity > 0, "consumer_queue_capacity must be positive");
        ensure!(self.reconnect_initial_ms > 0, "reconnect_initial_ms must be positive");
        Ok(())
    }

    /// Feed URL with the API token attached.
    pub fn feed_endpoint(&self) -> String {
        let sep = if self.feed_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.feed_url, sep, self.api_key)
    }

    pub fn window(&self) -> TimeDelta {
        TimeDelta::seconds(self.window_secs as i64)
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::minutes(self.retention_minutes as i64)
    }

    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(self.coalesce_interval_ms)
    }

    pub fn consumer_write_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_write_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}
