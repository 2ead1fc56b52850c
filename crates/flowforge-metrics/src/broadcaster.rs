//! WebSocket broadcaster (spec.md §4.10): each accepted client gets a
//! snapshot, then deltas at a 1 Hz cadence. Dropped clients are removed on
//! their next failed send; one client's disconnect never affects the rest.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::aggregator::{MetricsAggregator, MetricsSnapshot};

const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);
const CLIENT_BUFFER: usize = 16;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Frame<'a> {
    Snapshot { data: &'a MetricsSnapshot },
    Delta { data: &'a MetricsSnapshot },
}

struct Client {
    tx: mpsc::Sender<Message>,
}

#[derive(Clone)]
pub struct MetricsBroadcaster {
    aggregator: Arc<MetricsAggregator>,
    clients: Arc<Mutex<Vec<Client>>>,
}

impl MetricsBroadcaster {
    pub fn new(aggregator: Arc<MetricsAggregator>) -> Self {
        Self {
            aggregator,
            clients: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn router(self) -> Router {
        Router::new().route("/metrics/ws", get(ws_handler)).with_state(self)
    }

    /// Broadcast loop: ticks at [`BROADCAST_INTERVAL`], sends the current
    /// snapshot to every connected client, and drops any whose send channel
    /// is closed or full.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(BROADCAST_INTERVAL);
        loop {
            tick.tick().await;
            let snapshot = self.aggregator.snapshot().await;
            let frame = serde_json::to_string(&Frame::Delta { data: &snapshot }).expect("snapshot serializes");

            let mut clients = self.clients.lock().await;
            let before = clients.len();
            clients.retain(|client| client.tx.try_send(Message::Text(frame.clone())).is_ok());
            if clients.len() != before {
                debug!(dropped = before - clients.len(), "removed disconnected metrics clients");
            }
        }
    }

    async fn accept(&self, mut socket: WebSocket) {
        let snapshot = self.aggregator.snapshot().await;
        let hello = serde_json::to_string(&Frame::Snapshot { data: &snapshot }).expect("snapshot serializes");
        if socket.send(Message::Text(hello)).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients.lock().await.push(Client { tx });
        info!("metrics client connected");

        // Drain the per-client queue until the socket closes; we don't read
        // from the client, this is a server push channel only.
        while let Some(msg) = rx.recv().await {
            if socket.send(msg).await.is_err() {
                break;
            }
        }
        info!("metrics client disconnected");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(broadcaster): State<MetricsBroadcaster>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { broadcaster.accept(socket).await })
}
