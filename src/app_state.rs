// =============================================================================
// Central Application State
// =============================================================================
//
// Shared by the HTTP handlers via `State<Arc<AppState>>`. The aggregator and
// the router each guard their own table; AppState only hands out the Arcs.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::broadcast::FanoutRouter;
use crate::market_data::CandleAggregator;
use crate::runtime_config::RuntimeConfig;
use crate::store::CandleStore;

pub struct AppState {
    pub config: RuntimeConfig,
    pub aggregator: Arc<CandleAggregator>,
    pub router: Arc<FanoutRouter>,
    pub store: Arc<dyn CandleStore>,
    /// Used for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, store: Arc<dyn CandleStore>) -> Result<Self> {
        let aggregator = Arc::new(CandleAggregator::new(config.window())?);
        Ok(Self {
            config,
            aggregator,
            router: Arc::new(FanoutRouter::new()),
            store,
            start_time: Instant::now(),
        })
    }
}
