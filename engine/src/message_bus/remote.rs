//! WebSocket client of the bus broker
//!
//! A background task owns the connection. Callers talk to it through a
//! command channel, so a [`WsBus`] can be cloned and shared freely.
//!
//! Features:
//! - Auto-reconnect with exponential backoff
//! - Subscriptions are replayed after every reconnect
//! - Publishing while disconnected fails with `BusUnavailable`; the caller
//!   decides whether to retry

use async_trait::async_trait;
use courier_sdk::DispatchError;
use futures::stream::StreamExt;
use futures::SinkExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::frame::{ClientFrame, ServerFrame};
use super::{Backoff, MessageBus, Subscription, CHANNEL_BUFFER_SIZE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply<T> = oneshot::Sender<Result<T, DispatchError>>;

enum Command {
    Publish {
        channel: String,
        payload: String,
        reply: Reply<()>,
    },
    Subscribe {
        channel: String,
        tx: mpsc::Sender<String>,
        reply: Reply<()>,
    },
    Count {
        channel: String,
        reply: Reply<usize>,
    },
}

enum SessionEnd {
    Disconnected,
    Stopped,
}

/// Message bus backed by a remote broker
#[derive(Clone)]
pub struct WsBus {
    commands: mpsc::Sender<Command>,
    releases: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl WsBus {
    /// Connect to a broker
    ///
    /// The first connection attempt must succeed; later disconnects are
    /// retried in the background.
    ///
    /// # Arguments
    /// * `endpoint` - Broker url, e.g. `ws://127.0.0.1:7700/bus`
    /// * `token` - Shared secret sent as the `token` query parameter
    /// * `backoff` - Reconnect delays
    pub async fn connect(
        endpoint: &str,
        token: Option<&str>,
        backoff: Backoff,
    ) -> Result<Self, DispatchError> {
        let mut url = reqwest::Url::parse(endpoint)
            .map_err(|e| DispatchError::Config(format!("Invalid bus endpoint {}: {}", endpoint, e)))?;
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        let url = url.to_string();

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| {
                DispatchError::BusUnavailable(format!("Failed to connect to {}: {}", endpoint, e))
            })?;
        info!("Connected to bus broker at {}", endpoint);

        let (commands, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (releases, release_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let client = ClientLoop {
            url,
            endpoint: endpoint.to_string(),
            backoff,
            connected: connected.clone(),
            subscriptions: HashMap::new(),
            pending_subscribes: HashMap::new(),
            pending_counts: HashMap::new(),
            next_request_id: 0,
        };
        tokio::spawn(client.run(stream, command_rx, release_rx));

        Ok(Self {
            commands,
            releases,
            connected,
        })
    }

    /// Whether the connection to the broker is currently up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| DispatchError::BusUnavailable("bus client stopped".to_string()))?;
        rx.await
            .map_err(|_| DispatchError::BusUnavailable("bus client stopped".to_string()))?
    }
}

#[async_trait]
impl MessageBus for WsBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), DispatchError> {
        let channel = channel.to_string();
        self.request(|reply| Command::Publish {
            channel,
            payload,
            reply,
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, DispatchError> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let name = channel.to_string();
        self.request(|reply| Command::Subscribe {
            channel: name,
            tx,
            reply,
        })
        .await?;
        Ok(Subscription::new(channel, rx).with_release(self.releases.clone()))
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, DispatchError> {
        let channel = channel.to_string();
        self.request(|reply| Command::Count { channel, reply }).await
    }
}

/// State owned by the background connection task
struct ClientLoop {
    url: String,
    endpoint: String,
    backoff: Backoff,
    connected: Arc<AtomicBool>,
    /// Local subscribers per channel
    subscriptions: HashMap<String, Vec<mpsc::Sender<String>>>,
    /// Subscribe calls waiting for the broker's confirmation
    pending_subscribes: HashMap<String, Vec<Reply<()>>>,
    pending_counts: HashMap<u64, Reply<usize>>,
    next_request_id: u64,
}

impl ClientLoop {
    async fn run(
        mut self,
        mut stream: WsStream,
        mut commands: mpsc::Receiver<Command>,
        mut releases: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            match self.session(stream, &mut commands, &mut releases).await {
                SessionEnd::Stopped => {
                    info!("Bus client stopped");
                    return;
                }
                SessionEnd::Disconnected => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.fail_pending("connection to broker lost");
                    warn!("Lost connection to bus broker at {}", self.endpoint);
                }
            }

            stream = match self.reconnect(&mut commands, &mut releases).await {
                Some(stream) => stream,
                None => return,
            };
        }
    }

    /// Drive one connection until it drops or every handle is gone
    async fn session(
        &mut self,
        stream: WsStream,
        commands: &mut mpsc::Receiver<Command>,
        releases: &mut mpsc::UnboundedReceiver<String>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // Replay subscriptions
        let channels: Vec<String> = self.subscriptions.keys().cloned().collect();
        for channel in channels {
            let frame = ClientFrame::Subscribe { channel };
            if send_frame(&mut write, &frame).await.is_err() {
                return SessionEnd::Disconnected;
            }
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.handle_server_frame(&text),
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = write.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            info!("Bus connection closed by broker");
                            return SessionEnd::Disconnected;
                        }
                        Some(Err(e)) => {
                            warn!("Bus read error: {}", e);
                            return SessionEnd::Disconnected;
                        }
                        _ => {}
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return SessionEnd::Stopped;
                    };
                    if self.handle_command(command, &mut write).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(channel) = releases.recv() => {
                    if self.release(&channel) {
                        let frame = ClientFrame::Unsubscribe { channel };
                        if send_frame(&mut write, &frame).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }

    /// Retry the connection with backoff, answering commands meanwhile
    async fn reconnect(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        releases: &mut mpsc::UnboundedReceiver<String>,
    ) -> Option<WsStream> {
        loop {
            let delay = self.backoff.next_delay();
            info!("Reconnecting to bus broker in {:?}", delay);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = commands.recv() => {
                        let command = command?;
                        self.handle_offline_command(command);
                    }
                    Some(channel) = releases.recv() => {
                        self.release(&channel);
                    }
                }
            }

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!("Reconnected to bus broker at {}", self.endpoint);
                    self.connected.store(true, Ordering::SeqCst);
                    self.backoff.reset();
                    return Some(stream);
                }
                Err(e) => warn!("Bus reconnect failed: {}", e),
            }
        }
    }

    async fn handle_command<S>(&mut self, command: Command, write: &mut S) -> Result<(), ()>
    where
        S: SinkExt<WsMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        match command {
            Command::Publish {
                channel,
                payload,
                reply,
            } => {
                let result = send_frame(write, &ClientFrame::Publish { channel, payload }).await;
                let failed = result.is_err();
                let _ = reply.send(result);
                if failed {
                    return Err(());
                }
            }
            Command::Subscribe { channel, tx, reply } => {
                let subscribers = self.subscriptions.entry(channel.clone()).or_default();
                subscribers.push(tx);
                self.pending_subscribes
                    .entry(channel.clone())
                    .or_default()
                    .push(reply);
                if send_frame(write, &ClientFrame::Subscribe { channel }).await.is_err() {
                    return Err(());
                }
            }
            Command::Count { channel, reply } => {
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                self.pending_counts.insert(request_id, reply);
                let frame = ClientFrame::Count {
                    request_id,
                    channel,
                };
                if send_frame(write, &frame).await.is_err() {
                    return Err(());
                }
            }
        }
        Ok(())
    }

    fn handle_offline_command(&mut self, command: Command) {
        let unavailable = || DispatchError::BusUnavailable("not connected to broker".to_string());
        match command {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(unavailable()));
            }
            Command::Subscribe { channel, tx, reply } => {
                // Replayed once the connection is back
                self.subscriptions.entry(channel).or_default().push(tx);
                let _ = reply.send(Ok(()));
            }
            Command::Count { reply, .. } => {
                let _ = reply.send(Err(unavailable()));
            }
        }
    }

    fn handle_server_frame(&mut self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame from broker: {}", e);
                return;
            }
        };

        match frame {
            ServerFrame::Subscribed { channel } => {
                if let Some(replies) = self.pending_subscribes.remove(&channel) {
                    for reply in replies {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            ServerFrame::Message { channel, payload } => {
                let Some(subscribers) = self.subscriptions.get_mut(&channel) else {
                    debug!("Message on unsubscribed channel {}", channel);
                    return;
                };
                subscribers.retain(|tx| !tx.is_closed());
                for tx in subscribers.iter() {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(payload.clone()) {
                        warn!("Subscriber on {} is lagging, message dropped", channel);
                    }
                }
            }
            ServerFrame::Count { request_id, count } => {
                if let Some(reply) = self.pending_counts.remove(&request_id) {
                    let _ = reply.send(Ok(count));
                }
            }
            ServerFrame::Error { message } => {
                warn!("Broker rejected frame: {}", message);
            }
        }
    }

    /// Drop closed local subscribers; true when the channel has none left
    fn release(&mut self, channel: &str) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(channel) else {
            return false;
        };
        subscribers.retain(|tx| !tx.is_closed());
        if subscribers.is_empty() {
            self.subscriptions.remove(channel);
            return true;
        }
        false
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, reply) in self.pending_counts.drain() {
            let _ = reply.send(Err(DispatchError::BusUnavailable(reason.to_string())));
        }
        // Subscriptions stay registered and are replayed on reconnect
        for (_, replies) in self.pending_subscribes.drain() {
            for reply in replies {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &ClientFrame) -> Result<(), DispatchError>
where
    S: SinkExt<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    write
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| DispatchError::BusUnavailable(format!("Failed to send frame: {}", e)))
}
