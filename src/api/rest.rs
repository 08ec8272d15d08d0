// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// Read-only history endpoints backed by the candle store, plus the live
// snapshot and health probes. The WebSocket upgrade lives in `api::ws` but is
// mounted here so there is a single router.
//
// CORS is permissive: the consumers are browser and mobile dashboards.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::app_state::AppState;
use crate::types::Candle;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stocks-history", get(stocks_history))
        .route("/stocks-candles", get(stocks_candles))
        .route("/stocks-live", get(stocks_live))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "candle store query failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "candle store unavailable".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    subscribers: usize,
    symbols: Vec<String>,
    store: &'static str,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        subscribers: state.router.subscriber_count(),
        symbols: state.config.symbols.clone(),
        store: state.store.backend_type(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// History
// =============================================================================

/// Every stored candle grouped by symbol, each list oldest first.
async fn stocks_history(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BTreeMap<String, Vec<Candle>>>, ApiError> {
    let candles = state.store.candles(None).await?;

    let mut grouped: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    for candle in candles {
        grouped.entry(candle.symbol.clone()).or_default().push(candle);
    }
    Ok(Json(grouped))
}

#[derive(Deserialize)]
struct CandleQuery {
    symbol: Option<String>,
}

async fn stocks_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> Result<Json<Vec<Candle>>, ApiError> {
    let symbol = query
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing `symbol` query parameter"))?;

    let candles = state.store.candles(Some(symbol)).await?;
    Ok(Json(candles))
}

// =============================================================================
// Live snapshots
// =============================================================================

/// Open candles, all of them or just `?symbol=`.
async fn stocks_live(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CandleQuery>,
) -> impl IntoResponse {
    let candles: Vec<Candle> = match query.symbol.as_deref().map(str::trim) {
        Some(symbol) if !symbol.is_empty() => state.aggregator.snapshot(symbol).into_iter().collect(),
        _ => state.aggregator.snapshots(),
    };
    Json(candles)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::store::{CandleStore, MemoryCandleStore};
    use crate::types::TradeEvent;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn candle(symbol: &str, secs: i64) -> Candle {
        Candle {
            symbol: symbol.into(),
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 5.0,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    async fn state_with(candles: &[Candle]) -> Arc<AppState> {
        let store = Arc::new(MemoryCandleStore::new());
        for c in candles {
            store.save(c).await.unwrap();
        }
        Arc::new(AppState::new(RuntimeConfig::default(), store).unwrap())
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn history_groups_by_symbol() {
        let state = state_with(&[candle("AMZN", 120), candle("AAPL", 180), candle("AAPL", 60)]).await;
        let (status, body) = get_json(state, "/stocks-history").await;

        assert_eq!(status, StatusCode::OK);
        let aapl = body["AAPL"].as_array().unwrap();
        assert_eq!(aapl.len(), 2);
        assert_eq!(aapl[0]["timestamp"], "1970-01-01T00:01:00Z");
        assert_eq!(aapl[1]["timestamp"], "1970-01-01T00:03:00Z");
        assert_eq!(body["AMZN"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn candles_for_one_symbol() {
        let state = state_with(&[candle("AMZN", 120), candle("AAPL", 60)]).await;
        let (status, body) = get_json(state, "/stocks-candles?symbol=AMZN").await;

        assert_eq!(status, StatusCode::OK);
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["symbol"], "AMZN");
        assert_eq!(list[0]["high"], 12.0);
    }

    #[tokio::test]
    async fn candles_without_symbol_is_bad_request() {
        let state = state_with(&[]).await;
        let (status, body) = get_json(state, "/stocks-candles").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn live_reports_open_candles() {
        let state = state_with(&[]).await;
        state
            .aggregator
            .ingest(&TradeEvent::new("AAPL", 100.0, 1.0, Utc.timestamp_opt(0, 0).unwrap()));

        state
            .aggregator
            .ingest(&TradeEvent::new("AMZN", 50.0, 1.0, Utc.timestamp_opt(0, 0).unwrap()));

        let (status, body) = get_json(state.clone(), "/stocks-live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["symbol"], "AAPL");
        assert_eq!(body[0]["timestamp"], "1970-01-01T00:01:00Z");

        let (_, body) = get_json(state, "/stocks-live?symbol=AMZN").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["close"], 50.0);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = state_with(&[]).await;
        let (status, body) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["subscribers"], 0);
        assert_eq!(body["store"], "memory");
    }
}
