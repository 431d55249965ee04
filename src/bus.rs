//! The message bus abstraction (C1). The core only ever uses four
//! primitives against this trait: `subscribe`, `unsubscribe`, `broadcast`,
//! `send`. Everything else in the crate is a handler registered against
//! one of the channel constants in [`crate::protocol::messages`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::protocol::BusMessage;

pub type SubscriberId = Uuid;

/// A message as seen by a subscriber: which channel it arrived on (useful
/// when one subscriber listens to several channels) and the payload.
#[derive(Debug, Clone)]
pub struct BusEnvelope {
    pub channel: String,
    pub message: BusMessage,
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Registers a new subscriber on `channel` and returns its id plus the
    /// receiving half of its delivery queue. The caller is expected to
    /// spawn a task that drains the receiver — this is "one inbound
    /// dispatcher per channel" (§5) realized as one task per subscription.
    async fn subscribe(&self, channel: &str) -> (SubscriberId, mpsc::Receiver<BusEnvelope>);

    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId);

    /// Delivers `message` to every current subscriber of `channel`.
    async fn broadcast(&self, channel: &str, message: BusMessage) -> anyhow::Result<()>;

    /// Delivers `message` to subscribers of `channel` whose subscription
    /// was registered under the given `target_id` tag (used for
    /// per-proxy/per-server derived channels where the channel name alone
    /// already encodes the target, so in practice this forwards to
    /// `broadcast`; kept distinct to match the four-primitive contract).
    async fn send(&self, target_id: &str, channel: &str, message: BusMessage) -> anyhow::Result<()>;
}

struct Subscription {
    id: SubscriberId,
    sender: mpsc::Sender<BusEnvelope>,
}

/// In-process bus used both as the production transport (the core never
/// terminates an external connection itself) and as the acceptance-test
/// harness.
#[derive(Default)]
pub struct InMemoryBus {
    channels: DashMap<String, Vec<Subscription>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver_to_channel(&self, channel: &str, message: &BusMessage) {
        let Some(mut subs) = self.channels.get_mut(channel) else {
            return;
        };
        subs.retain(|sub| {
            let envelope = BusEnvelope {
                channel: channel.to_string(),
                message: message.clone(),
            };
            match sub.sender.try_send(envelope) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel, subscriber = %sub.id, "bus subscriber queue full, dropping message");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn subscribe(&self, channel: &str) -> (SubscriberId, mpsc::Receiver<BusEnvelope>) {
        let (tx, rx) = mpsc::channel(1024);
        let id = Uuid::new_v4();
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscription { id, sender: tx });
        (id, rx)
    }

    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.retain(|sub| sub.id != subscriber);
        }
    }

    async fn broadcast(&self, channel: &str, message: BusMessage) -> anyhow::Result<()> {
        self.deliver_to_channel(channel, &message);
        Ok(())
    }

    async fn send(&self, _target_id: &str, channel: &str, message: BusMessage) -> anyhow::Result<()> {
        self.deliver_to_channel(channel, &message);
        Ok(())
    }
}

pub type SharedBus = Arc<dyn Bus>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::HeartbeatMessage;

    fn heartbeat(node_id: &str) -> BusMessage {
        BusMessage::Heartbeat(HeartbeatMessage {
            node_id: node_id.to_string(),
            player_count: 0,
            tps: 20.0,
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let bus = InMemoryBus::new();
        let (_id1, mut rx1) = bus.subscribe("heartbeat").await;
        let (_id2, mut rx2) = bus.subscribe("heartbeat").await;

        bus.broadcast("heartbeat", heartbeat("fulcrum-server-1")).await.unwrap();

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert_eq!(bus.delivered_count(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let (id, mut rx) = bus.subscribe("heartbeat").await;
        bus.unsubscribe("heartbeat", id).await;

        bus.broadcast("heartbeat", heartbeat("fulcrum-server-1")).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_next_broadcast() {
        let bus = InMemoryBus::new();
        let (_id, rx) = bus.subscribe("heartbeat").await;
        drop(rx);

        bus.broadcast("heartbeat", heartbeat("fulcrum-server-1")).await.unwrap();
        assert_eq!(bus.channels.get("heartbeat").unwrap().len(), 0);
    }
}
