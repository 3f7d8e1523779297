//! In-process message bus
//!
//! Each subscriber gets a bounded channel with [`CHANNEL_BUFFER_SIZE`]
//! capacity. Publishing never waits on a slow subscriber: when a subscriber's
//! buffer is full the message is dropped for that subscriber only.

use async_trait::async_trait;
use courier_sdk::DispatchError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{MessageBus, Subscription, CHANNEL_BUFFER_SIZE};

/// Message bus for pub/sub communication inside one process
///
/// Cloning is cheap; all clones share the same channels.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    /// Map of channel names to lists of subscribers
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryBus {
    /// Create a new InMemoryBus
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the bus
    ///
    /// Every open subscription ends, and later calls fail with
    /// [`DispatchError::BusUnavailable`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.lock().await.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of channels with at least one live subscriber
    pub async fn channel_count(&self) -> usize {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, subscribers| {
            subscribers.retain(|tx| !tx.is_closed());
            !subscribers.is_empty()
        });
        channels.len()
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::BusUnavailable("bus is shut down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), DispatchError> {
        self.ensure_open()?;

        let mut channels = self.channels.lock().await;
        let Some(subscribers) = channels.get_mut(channel) else {
            tracing::trace!("No subscribers on {}, message dropped", channel);
            return Ok(());
        };

        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(payload.clone()) {
                tracing::warn!("Subscriber on {} is lagging, message dropped", channel);
            }
        }
        if subscribers.is_empty() {
            channels.remove(channel);
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, DispatchError> {
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(channel, rx))
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, DispatchError> {
        self.ensure_open()?;

        let channels = self.channels.lock().await;
        Ok(channels
            .get(channel)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("document_tasks").await.unwrap();

        bus.publish("document_tasks", "task-1".to_string())
            .await
            .unwrap();

        assert_eq!(sub.recv().await.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = InMemoryBus::new();
        let mut sub1 = bus.subscribe("results").await.unwrap();
        let mut sub2 = bus.subscribe("results").await.unwrap();

        bus.publish("results", "done".to_string()).await.unwrap();

        // Both subscribers should receive the message
        assert_eq!(sub1.recv().await.as_deref(), Some("done"));
        assert_eq!(sub2.recv().await.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = InMemoryBus::new();
        let mut audio = bus.subscribe("audio_tasks").await.unwrap();
        let mut image = bus.subscribe("image_tasks").await.unwrap();

        bus.publish("audio_tasks", "a".to_string()).await.unwrap();
        bus.publish("image_tasks", "i".to_string()).await.unwrap();

        assert_eq!(audio.recv().await.as_deref(), Some("a"));
        assert_eq!(image.recv().await.as_deref(), Some("i"));
        assert!(audio.rx.try_recv().is_err());
        assert!(image.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = InMemoryBus::new();
        bus.publish("nobody", "lost".to_string()).await.unwrap();

        // A late subscriber does not see earlier messages
        let mut sub = bus.subscribe("nobody").await.unwrap();
        bus.publish("nobody", "seen".to_string()).await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("seen"));
    }

    #[tokio::test]
    async fn test_bounded_channel_never_blocks_publisher() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("progress_C1").await.unwrap();

        // Publish more messages than the channel buffer size
        for i in 0..CHANNEL_BUFFER_SIZE + 10 {
            bus.publish("progress_C1", i.to_string()).await.unwrap();
        }

        let mut count = 0;
        while sub.rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CHANNEL_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_drops() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.subscriber_count("audio_tasks").await.unwrap(), 0);

        let sub1 = bus.subscribe("audio_tasks").await.unwrap();
        let sub2 = bus.subscribe("audio_tasks").await.unwrap();
        assert_eq!(bus.subscriber_count("audio_tasks").await.unwrap(), 2);

        drop(sub1);
        assert_eq!(bus.subscriber_count("audio_tasks").await.unwrap(), 1);

        drop(sub2);
        assert_eq!(bus.subscriber_count("audio_tasks").await.unwrap(), 0);
        assert_eq!(bus.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions_and_rejects_calls() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("results").await.unwrap();

        bus.shutdown().await;

        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.publish("results", "x".to_string()).await,
            Err(DispatchError::BusUnavailable(_))
        ));
        assert!(bus.subscribe("results").await.is_err());
        assert!(bus.subscriber_count("results").await.is_err());
    }
}
