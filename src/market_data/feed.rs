// =============================================================================
// Trade Feed - Finnhub-style trade WebSocket
// =============================================================================
//
// Connects to the upstream feed, subscribes every configured symbol and pushes
// each decoded trade into the `TradeIngestor`. Anything that is not a trade
// message (pings, acks, garbage) is skipped. Connection loss is handled by
// `run_feed_with_backoff`, which reconnects and resubscribes.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::ingest::TradeIngestor;
use crate::types::TradeEvent;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<RawTrade>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "v")]
    volume: f64,
    #[serde(rename = "t")]
    timestamp_ms: i64,
}

/// Decode one feed frame into the trades it carries.
///
/// Expected shape:
/// ```json
/// { "type": "trade", "data": [ { "s": "AAPL", "p": 187.4, "v": 100, "t": 1700000000000 } ] }
/// ```
///
/// Non-trade messages decode to an empty list. Individual entries with an
/// unusable price, size or timestamp are dropped.
pub fn parse_feed_message(text: &str) -> Result<Vec<TradeEvent>> {
    let msg: FeedMessage = serde_json::from_str(text).context("failed to parse feed JSON")?;

    if msg.kind != "trade" {
        return Ok(Vec::new());
    }

    let trades = msg
        .data
        .into_iter()
        .filter_map(|raw| {
            let timestamp = DateTime::from_timestamp_millis(raw.timestamp_ms)?;
            let trade = TradeEvent::new(raw.symbol, raw.price, raw.volume, timestamp);
            if trade.is_valid() {
                Some(trade)
            } else {
                debug!(symbol = %trade.symbol, price = trade.price, size = trade.size, "dropping invalid trade");
                None
            }
        })
        .collect();

    Ok(trades)
}

fn subscribe_frame(symbol: &str) -> String {
    serde_json::json!({ "type": "subscribe", "symbol": symbol }).to_string()
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect delay: doubles on every failure, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// A session that stayed up this long resets the backoff.
const HEALTHY_SESSION: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Feed WebSocket session
// ---------------------------------------------------------------------------

/// Why a feed session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Connect to the feed, subscribe `symbols` and pump trades into `ingestor`
/// until the connection drops or shutdown is requested.
pub async fn run_feed_session(
    url: &str,
    symbols: &[String],
    ingestor: &TradeIngestor,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd> {
    info!(url = %redact_token(url), "connecting to trade feed");

    let (ws_stream, _response) = tokio::select! {
        _ = shutdown.changed() => {
            info!("shutdown requested while connecting to trade feed");
            return Ok(SessionEnd::Shutdown);
        }
        connected = connect_async(url) => connected.context("failed to connect to trade feed")?,
    };

    let (mut write, mut read) = ws_stream.split();

    for symbol in symbols {
        write
            .send(Message::Text(subscribe_frame(symbol)))
            .await
            .with_context(|| format!("failed to subscribe {symbol}"))?;
    }
    info!(symbols = ?symbols, "trade feed connected and subscribed");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown requested, closing trade feed");
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_feed_message(&text) {
                        Ok(trades) => ingestor.ingest_batch(&trades),
                        Err(e) => warn!(error = %e, "skipping undecodable feed message"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "trade feed sent close frame");
                    return Ok(SessionEnd::Disconnected);
                }
                // Ping / Pong / Binary -- tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "trade feed read error");
                    return Err(e.into());
                }
                None => {
                    warn!("trade feed stream ended");
                    return Ok(SessionEnd::Disconnected);
                }
            }
        }
    }
}

/// Keep a feed session alive for the lifetime of the process, reconnecting
/// with exponential backoff until shutdown is requested.
pub async fn run_feed_with_backoff(
    url: String,
    symbols: Vec<String>,
    ingestor: TradeIngestor,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        match run_feed_session(&url, &symbols, &ingestor, &mut shutdown).await {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Disconnected) => {}
            Err(e) => error!(error = %e, "trade feed session failed"),
        }

        if started.elapsed() >= HEALTHY_SESSION {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        warn!(delay_ms = delay.as_millis() as u64, "reconnecting to trade feed");

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("trade feed loop stopped");
}

/// Strip the `token` query value before a URL is logged.
fn redact_token(url: &str) -> String {
    match url.split_once("token=") {
        Some((head, _)) => format!("{head}token=***"),
        None => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::CandleAggregator;
    use crate::store::MemoryCandleStore;
    use crate::types::{CandleUpdate, UpdateKind};
    use chrono::TimeDelta;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, Notify};
    use tokio_tungstenite::accept_async;

    #[test]
    fn parse_trade_message() {
        let json = r#"{
            "type": "trade",
            "data": [
                { "s": "AAPL", "p": 187.25, "v": 100, "t": 1700000000123, "c": ["1"] },
                { "s": "AMZN", "p": 143.5, "v": 0.5, "t": 1700000000456 }
            ]
        }"#;
        let trades = parse_feed_message(json).expect("should parse");
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "AAPL");
        assert_eq!(trades[0].price, 187.25);
        assert_eq!(trades[0].size, 100.0);
        assert_eq!(trades[0].timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(trades[1].symbol, "AMZN");
    }

    #[test]
    fn non_trade_messages_are_empty() {
        assert!(parse_feed_message(r#"{"type":"ping"}"#).unwrap().is_empty());
        assert!(parse_feed_message(r#"{"type":"error","msg":"nope"}"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(parse_feed_message("not json").is_err());
        assert!(parse_feed_message(r#"{"data":[]}"#).is_err());
        assert!(parse_feed_message(r#"{"type":"trade","data":[{"s":"AAPL"}]}"#).is_err());
    }

    #[test]
    fn invalid_entries_are_dropped() {
        let json = r#"{"type":"trade","data":[
            { "s": "AAPL", "p": -1.0, "v": 1, "t": 1700000000000 },
            { "s": "AAPL", "p": 10.0, "v": -3, "t": 1700000000000 },
            { "s": "AAPL", "p": 10.0, "v": 3, "t": 1700000000000 }
        ]}"#;
        let trades = parse_feed_message(json).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].size, 3.0);
    }

    #[test]
    fn subscribe_frame_shape() {
        let frame: serde_json::Value = serde_json::from_str(&subscribe_frame("AAPL")).unwrap();
        assert_eq!(frame["type"], "subscribe");
        assert_eq!(frame["symbol"], "AAPL");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn token_is_redacted() {
        assert_eq!(redact_token("wss://ws.finnhub.io?token=abc"), "wss://ws.finnhub.io?token=***");
        assert_eq!(redact_token("wss://example"), "wss://example");
    }

    // -----------------------------------------------------------------------
    // Feed session against a local server
    // -----------------------------------------------------------------------

    fn ingestor() -> (TradeIngestor, mpsc::UnboundedReceiver<CandleUpdate>) {
        let aggregator = Arc::new(CandleAggregator::new(TimeDelta::seconds(60)).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let ingestor = TradeIngestor::new(
            aggregator,
            Arc::new(MemoryCandleStore::new()),
            tx,
            Arc::new(Notify::new()),
        );
        (ingestor, rx)
    }

    async fn local_feed() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn read_subscriptions<S>(ws: &mut S, n: usize) -> Vec<String>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut symbols = Vec::new();
        while symbols.len() < n {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("subscribe frame")
                .unwrap()
                .unwrap();
            let frame: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(frame["type"], "subscribe");
            symbols.push(frame["symbol"].as_str().unwrap().to_string());
        }
        symbols
    }

    #[tokio::test]
    async fn resubscribes_after_disconnect_and_stops_on_shutdown() {
        let (listener, url) = local_feed().await;
        let (ingestor, mut updates) = ingestor();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let symbols = vec!["AAPL".to_string(), "AMZN".to_string()];

        let feed = tokio::spawn(run_feed_with_backoff(
            url,
            symbols.clone(),
            ingestor,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            shutdown_rx,
        ));

        // First session: one subscribe per symbol, then trades flow through.
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = accept_async(stream).await.unwrap();
        assert_eq!(read_subscriptions(&mut first, 2).await, symbols);

        first
            .send(Message::Text(
                r#"{"type":"trade","data":[{"s":"AAPL","p":100.0,"v":1,"t":1700000000000}]}"#.into(),
            ))
            .await
            .unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("trade reaches the update channel")
            .unwrap();
        assert_eq!(update.kind, UpdateKind::Live);
        assert_eq!(update.candle.symbol, "AAPL");

        drop(first);

        // Second session: every symbol is subscribed again.
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("feed reconnects")
            .unwrap();
        let mut second = accept_async(stream).await.unwrap();
        assert_eq!(read_subscriptions(&mut second, 2).await, symbols);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), feed)
            .await
            .expect("feed loop stops on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_hanging_connect() {
        let (listener, url) = local_feed().await;
        let (ingestor, _updates) = ingestor();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let feed = tokio::spawn(run_feed_with_backoff(
            url,
            vec!["AAPL".to_string()],
            ingestor,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            shutdown_rx,
        ));

        // Accept the TCP connection but never answer the handshake.
        let (_stalled, _) = listener.accept().await.unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), feed)
            .await
            .expect("shutdown does not wait for the connect")
            .unwrap();
    }
}
