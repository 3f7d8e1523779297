//! Message Bus for inter-process communication
//!
//! The coordinator and the capability workers never share memory. Everything
//! they exchange goes through named channels on a fire-and-forget pub/sub bus:
//! a message published while nobody is subscribed is dropped, and the bus
//! gives no delivery or ordering guarantee across channels.
//!
//! Two implementations exist:
//! - [`InMemoryBus`]: in-process hub with bounded per-subscriber channels.
//!   Used directly by tests and as the backing store of the broker.
//! - [`WsBus`]: client of a [`broker`] process over WebSocket, used when the
//!   coordinator and workers run as separate processes.

use async_trait::async_trait;
use courier_sdk::{Capability, DispatchError, Envelope};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::daemon::Shutdown;

pub mod broker;
pub mod frame;
pub mod memory;
pub mod remote;

pub use broker::Broker;
pub use memory::InMemoryBus;
pub use remote::WsBus;

/// Channel buffer size for bounded subscriber channels
pub const CHANNEL_BUFFER_SIZE: usize = 100;

/// Pub/sub transport shared by the coordinator and the workers
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a channel
    ///
    /// Succeeds even when nobody is subscribed; the message is then lost.
    /// Fails with [`DispatchError::BusUnavailable`] when the transport is down.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), DispatchError>;

    /// Subscribe to a channel
    ///
    /// The subscription ends when the returned handle is dropped.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, DispatchError>;

    /// Number of live subscribers on a channel, across all processes
    async fn subscriber_count(&self, channel: &str) -> Result<usize, DispatchError>;
}

/// Live subscriber count on every capability's task channel
pub async fn worker_counts(
    bus: &dyn MessageBus,
) -> Vec<(Capability, Result<usize, DispatchError>)> {
    let mut counts = Vec::with_capacity(Capability::ALL.len());
    for capability in Capability::ALL {
        let count = bus.subscriber_count(&capability.task_channel()).await;
        counts.push((capability, count));
    }
    counts
}

/// Encode an envelope and publish it
pub async fn publish_envelope<E: Envelope>(
    bus: &dyn MessageBus,
    channel: &str,
    envelope: &E,
) -> Result<(), DispatchError> {
    let payload = envelope.encode()?;
    bus.publish(channel, payload).await
}

/// Receiving end of a channel subscription
///
/// Yields raw payloads in publish order. The stream ends when the bus shuts
/// down or the connection to the broker is dropped for good.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
    release: Option<mpsc::UnboundedSender<String>>,
}

impl Subscription {
    pub(crate) fn new(channel: impl Into<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            release: None,
        }
    }

    /// Notify `release` with the channel name when this subscription drops
    pub(crate) fn with_release(mut self, release: mpsc::UnboundedSender<String>) -> Self {
        self.release = Some(release);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next raw payload
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Receive and decode the next envelope
    ///
    /// Returns `Some(Err(_))` for a malformed payload so the caller can log
    /// and continue; `None` once the subscription has ended.
    pub async fn next_envelope<E: Envelope>(&mut self) -> Option<Result<E, DispatchError>> {
        let raw = self.rx.recv().await?;
        Some(E::decode(&raw))
    }
}

impl Stream for Subscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver must read as closed before the release is seen
        self.rx.close();
        if let Some(release) = &self.release {
            let _ = release.send(self.channel.clone());
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Exponential backoff used for reconnects and resubscribes
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
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; doubles up to the maximum
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Start over after a successful attempt
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Subscribe to `channel`, retrying with backoff until it works
///
/// Returns `None` if shutdown is signaled first.
pub async fn subscribe_with_retry(
    bus: &dyn MessageBus,
    channel: &str,
    backoff: &mut Backoff,
    shutdown: &Shutdown,
) -> Option<Subscription> {
    loop {
        if shutdown.is_triggered() {
            return None;
        }

        match bus.subscribe(channel).await {
            Ok(subscription) => {
                backoff.reset();
                return Some(subscription);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Subscribe to {} failed: {} (retrying in {:?})",
                    channel,
                    e,
                    delay
                );
                tokio::select! {
                    _ = shutdown.wait() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
