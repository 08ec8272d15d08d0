// =============================================================================
// WebSocket Handler - per-consumer candle stream
// =============================================================================
//
// Clients connect to `/ws` and send a symbol (e.g. `AAPL`) as a text frame.
// Each text frame replaces the previous subscription. From then on the
// consumer receives every candle update the router delivers for that symbol.
//
// Each connection runs two halves:
//   - the reader (this task): subscription frames, close, errors,
//   - the writer (spawned): drains the consumer's queue onto the socket, with
//     every write bounded by `consumer_write_timeout`.
//
// When the writer gives up its queue closes, and the router prunes the
// consumer on its next delivery attempt. A pruned consumer is evicted: the
// reader stops and the connection is closed.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcast::{ConsumerId, ConsumerSink, Frame};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let consumer = ConsumerId::new();
    info!(consumer = %consumer, "client connected");

    let (sender, mut receiver) = socket.split();
    let (queue_tx, queue) = mpsc::channel::<Frame>(state.config.consumer_queue_capacity);
    let sink = ConsumerSink::new(queue_tx);
    let write_timeout = state.config.consumer_write_timeout();
    let mut writer = tokio::spawn(write_loop(sender, queue, write_timeout, consumer));

    loop {
        let msg = tokio::select! {
            _ = sink.evicted() => {
                info!(consumer = %consumer, "consumer dropped by router, closing connection");
                break;
            }
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                let symbol = text.trim();
                if symbol.is_empty() {
                    debug!(consumer = %consumer, "ignoring empty subscription frame");
                    continue;
                }
                state.router.subscribe(consumer, symbol, sink.clone());
            }
            Some(Ok(Message::Close(_))) => {
                debug!(consumer = %consumer, "close frame received");
                break;
            }
            // Pings are answered by the protocol layer; binary is not part of
            // the protocol.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(consumer = %consumer, error = %e, "error reading from client");
                break;
            }
            None => break,
        }
    }

    state.router.unsubscribe(consumer);
    drop(sink);
    // With every sender gone the writer flushes what is queued and sends a
    // close frame.
    if tokio::time::timeout(write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(consumer = %consumer, "client disconnected");
}

/// Drain `queue` onto the socket until the queue closes, a write fails, or a
/// write takes longer than `write_timeout`.
async fn write_loop<S>(
    mut sender: S,
    mut queue: mpsc::Receiver<Frame>,
    write_timeout: Duration,
    consumer: ConsumerId,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = queue.recv().await {
        match tokio::time::timeout(write_timeout, sender.send(Message::Text(frame.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(consumer = %consumer, error = %e, "send to client failed");
                break;
            }
            Err(_) => {
                warn!(
                    consumer = %consumer,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "send to client timed out"
                );
                break;
            }
        }
    }

    queue.close();
    let _ = tokio::time::timeout(write_timeout, sender.close()).await;
}

// =============================================================================
// Tests
// =============================================================================
