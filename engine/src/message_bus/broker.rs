//! Bus broker
//!
//! Serves an [`InMemoryBus`] to other processes over WebSocket.
//!
//! # Endpoints
//!
//! - GET /bus?token=... - WebSocket upgrade, speaks [`super::frame`]
//! - GET /health - Liveness probe
//!
//! When a token is configured, connections without a matching `token` query
//! parameter are rejected with 401.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame::{ClientFrame, ServerFrame};
use super::{InMemoryBus, MessageBus, CHANNEL_BUFFER_SIZE};

/// WebSocket query parameters for authentication
#[derive(Debug, Deserialize)]
struct BusQuery {
    token: Option<String>,
}

/// State shared across handlers
#[derive(Clone)]
struct BrokerState {
    bus: InMemoryBus,
    token: Option<Arc<str>>,
}

/// WebSocket front of an in-memory bus
pub struct Broker {
    bus: InMemoryBus,
    token: Option<String>,
}

impl Broker {
    /// Create a broker over `bus`
    ///
    /// # Arguments
    /// * `bus` - Bus holding the channels
    /// * `token` - Shared secret clients must present, or `None` for open access
    pub fn new(bus: InMemoryBus, token: Option<String>) -> Self {
        Self { bus, token }
    }

    /// Build the axum router
    pub fn router(&self) -> Router {
        let state = BrokerState {
            bus: self.bus.clone(),
            token: self.token.as_deref().map(Arc::from),
        };

        Router::new()
            .route("/bus", get(bus_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    /// Serve until `shutdown` resolves, then close the bus
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!("Bus broker listening on ws://{}/bus", addr);

        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bus.shutdown().await;
        tracing::info!("Bus broker stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<BrokerState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "channels": state.bus.channel_count().await,
    }))
}

async fn bus_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<BusQuery>,
    State(state): State<BrokerState>,
) -> Response {
    if let Some(expected) = &state.token {
        if query.token.as_deref() != Some(expected.as_ref()) {
            tracing::warn!("Rejected bus connection with missing or invalid token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid or missing token"})),
            )
                .into_response();
        }
    }

    ws.on_upgrade(|socket| handle_socket(socket, state.bus))
}

/// Handle one client connection
///
/// Each subscribed channel gets a forwarder task that copies payloads to a
/// single outbound queue, drained by a writer task.
async fn handle_socket(socket: WebSocket, bus: InMemoryBus) {
    tracing::debug!("Bus client connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(CHANNEL_BUFFER_SIZE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Malformed bus frame: {}", e);
                let _ = out_tx
                    .send(ServerFrame::Error {
                        message: format!("malformed frame: {}", e),
                    })
                    .await;
                continue;
            }
        };

        match frame {
            ClientFrame::Subscribe { channel } => {
                if !forwarders.contains_key(&channel) {
                    match bus.subscribe(&channel).await {
                        Ok(mut sub) => {
                            let tx = out_tx.clone();
                            let name = channel.clone();
                            let handle = tokio::spawn(async move {
                                while let Some(payload) = sub.recv().await {
                                    let frame = ServerFrame::Message {
                                        channel: name.clone(),
                                        payload,
                                    };
                                    if tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                            });
                            forwarders.insert(channel.clone(), handle);
                        }
                        Err(e) => {
                            let _ = out_tx
                                .send(ServerFrame::Error {
                                    message: e.to_string(),
                                })
                                .await;
                            continue;
                        }
                    }
                }
                let _ = out_tx.send(ServerFrame::Subscribed { channel }).await;
            }
            ClientFrame::Unsubscribe { channel } => {
                if let Some(handle) = forwarders.remove(&channel) {
                    handle.abort();
                }
            }
            ClientFrame::Publish { channel, payload } => {
                if let Err(e) = bus.publish(&channel, payload).await {
                    let _ = out_tx
                        .send(ServerFrame::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            ClientFrame::Count {
                request_id,
                channel,
            } => {
                let count = bus.subscriber_count(&channel).await.unwrap_or(0);
                let _ = out_tx.send(ServerFrame::Count { request_id, count }).await;
            }
        }
    }

    for (_, handle) in forwarders {
        handle.abort();
    }
    drop(out_tx);
    let _ = writer.await;

    tracing::debug!("Bus client disconnected");
}
