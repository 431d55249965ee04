//! Network profile & rank broadcasts (C11). A single active
//! [`NetworkProfile`] is held in memory, mirrored to the KV store, and
//! handed back to any requester; changing it fans out
//! `NetworkConfigUpdatedMessage` to every subscriber of the updated channel.
//! Rank mutations have no persisted state of their own — they are a pure
//! broadcast relay.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::bus::SharedBus;
use crate::kv::{self, keys, Kv};
use crate::protocol::messages::{
    NetworkConfigRequestMessage, NetworkConfigUpdatedMessage, RankSyncMessage, CH_REGISTRY_NETWORK_CONFIG_UPDATED,
    CH_REGISTRY_RANK_UPDATE,
};
use crate::protocol::types::NetworkProfile;
use crate::protocol::BusMessage;

pub struct NetworkProfileStore {
    active: RwLock<Option<NetworkProfile>>,
    bus: SharedBus,
    kv: Arc<dyn Kv>,
}

impl NetworkProfileStore {
    pub fn new(bus: SharedBus, kv: Arc<dyn Kv>) -> Arc<Self> {
        Arc::new(Self { active: RwLock::new(None), bus, kv })
    }

    pub async fn load_from_kv(&self) {
        if let Ok(Some(profile)) = kv::get_typed::<NetworkProfile>(self.kv.as_ref(), keys::network_profile_active()).await {
            *self.active.write().await = Some(profile);
        }
    }

    pub async fn current(&self) -> Option<NetworkProfile> {
        self.active.read().await.clone()
    }

    /// Replaces the active profile and broadcasts the change. There is no
    /// separate "create" path: the first profile set is also a change.
    pub async fn set_active(&self, mut profile: NetworkProfile) {
        profile.updated_at = Utc::now();
        if let Err(err) = kv::put_typed(self.kv.as_ref(), keys::network_profile_active(), &profile).await {
            tracing::warn!(profile_id = %profile.profile_id, error = %err, "failed to persist network profile");
        }
        *self.active.write().await = Some(profile.clone());

        info!(profile_id = %profile.profile_id, tag = %profile.tag, "network profile updated");
        let _ = self
            .bus
            .broadcast(
                CH_REGISTRY_NETWORK_CONFIG_UPDATED,
                BusMessage::NetworkConfigUpdated(NetworkConfigUpdatedMessage { profile }),
            )
            .await;
    }

    /// Responds to a `NetworkConfigRequestMessage` by re-broadcasting the
    /// current snapshot; there is no per-requester reply channel in the
    /// catalog, so the requester is expected to be a subscriber of the
    /// shared updated-profile channel.
    pub async fn handle_request(&self, msg: NetworkConfigRequestMessage) {
        let Some(profile) = self.current().await else {
            tracing::warn!(requester_id = %msg.requester_id, "network profile requested before one was ever set");
            return;
        };
        let _ = self
            .bus
            .broadcast(
                CH_REGISTRY_NETWORK_CONFIG_UPDATED,
                BusMessage::NetworkConfigUpdated(NetworkConfigUpdatedMessage { profile }),
            )
            .await;
    }

    /// Rank mutations pass straight through to a broadcast; nothing about a
    /// rank assignment is persisted by this component.
    pub async fn handle_rank_sync(&self, msg: RankSyncMessage) {
        let _ = self.bus.broadcast(CH_REGISTRY_RANK_UPDATE, BusMessage::RankSync(msg)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, InMemoryBus};
    use crate::kv::InMemoryKv;
    use std::collections::HashMap;

    fn store() -> Arc<NetworkProfileStore> {
        NetworkProfileStore::new(Arc::new(InMemoryBus::new()), Arc::new(InMemoryKv::new()))
    }

    fn profile(id: &str) -> NetworkProfile {
        NetworkProfile {
            profile_id: id.to_string(),
            tag: "live".to_string(),
            server_ip: "play.example.net".to_string(),
            motd: vec!["welcome".to_string()],
            scoreboard_title: "FULCRUM".to_string(),
            scoreboard_footer: "play.example.net".to_string(),
            ranks: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn set_active_is_visible_to_current() {
        let store = store();
        store.set_active(profile("p1")).await;
        assert_eq!(store.current().await.unwrap().profile_id, "p1");
    }

    #[tokio::test]
    async fn set_active_broadcasts_the_update() {
        let bus = Arc::new(InMemoryBus::new());
        let store = NetworkProfileStore::new(Arc::clone(&bus) as SharedBus, Arc::new(InMemoryKv::new()));
        let (_, mut rx) = bus.subscribe(CH_REGISTRY_NETWORK_CONFIG_UPDATED).await;

        store.set_active(profile("p2")).await;

        let envelope = rx.recv().await.unwrap();
        match envelope.message {
            BusMessage::NetworkConfigUpdated(msg) => assert_eq!(msg.profile.profile_id, "p2"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_with_no_active_profile_is_a_noop() {
        let store = store();
        store.handle_request(NetworkConfigRequestMessage { requester_id: "proxy-1".to_string() }).await;
    }
}
