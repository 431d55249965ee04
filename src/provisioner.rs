//! Slot provisioner (C8): on-demand creation of a new logical slot for a
//! family when the routing coordinator cannot find spare capacity.
//! Provision intent is deduplicated per family through a short-TTL lock in
//! the KV mirror (§4.8), so at most one provision request is outstanding
//! for a given family at a time.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::SharedBus;
use crate::distributed::{DistributedLock, LockHandle};
use crate::kv::keys;
use crate::metrics::FulcrumMetrics;
use crate::protocol::messages::{server_player_route_channel, SlotFamilyAdvertisement, SlotStatusUpdate};
use crate::protocol::BusMessage;
use crate::registry::ServerRegistry;
use crate::retry::retry_provision_operation;

/// Default provision-lock TTL (§4.8), used by callers that construct a
/// [`SlotProvisioner`] without an explicit override.
pub const DEFAULT_PROVISION_LOCK_TTL: Duration = Duration::from_secs(30);

pub struct ProvisionedSlot {
    pub server_id: String,
    pub slot_id: String,
}

pub struct SlotProvisioner {
    servers: Arc<ServerRegistry>,
    lock: Arc<dyn DistributedLock>,
    bus: SharedBus,
    metrics: Option<Arc<FulcrumMetrics>>,
    lock_ttl: Duration,
    advertisements: DashMap<String, SlotFamilyAdvertisement>,
    held_locks: DashMap<String, LockHandle>,
}

impl SlotProvisioner {
    pub fn new(
        servers: Arc<ServerRegistry>,
        lock: Arc<dyn DistributedLock>,
        bus: SharedBus,
        metrics: Option<Arc<FulcrumMetrics>>,
    ) -> Arc<Self> {
        Self::with_lock_ttl(servers, lock, bus, metrics, DEFAULT_PROVISION_LOCK_TTL)
    }

    pub fn with_lock_ttl(
        servers: Arc<ServerRegistry>,
        lock: Arc<dyn DistributedLock>,
        bus: SharedBus,
        metrics: Option<Arc<FulcrumMetrics>>,
        lock_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers,
            lock,
            bus,
            metrics,
            lock_ttl,
            advertisements: DashMap::new(),
            held_locks: DashMap::new(),
        })
    }

    pub fn record_advertisement(&self, ad: SlotFamilyAdvertisement) {
        self.advertisements.insert(ad.server_id.clone(), ad);
    }

    fn candidate_server(&self, family_id: &str) -> Option<(String, Option<String>)> {
        self.advertisements.iter().find_map(|entry| {
            let ad = entry.value();
            let capacity = *ad.family_capacities.get(family_id)?;
            let current = self.servers.slot_count_for_family(&ad.server_id, family_id);
            if current >= capacity {
                return None;
            }
            let variant = ad.family_variants.get(family_id).and_then(|v| v.first()).cloned();
            Some((ad.server_id.clone(), variant))
        })
    }

    /// Requests a new slot for `family_id`, returning the chosen backend
    /// and slot id on success. Returns `None` when another provision for
    /// the family is already outstanding or no backend has spare capacity.
    pub async fn request_provision(
        &self,
        family_id: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Option<ProvisionedSlot> {
        if let Some(metrics) = &self.metrics {
            metrics.increment_provision_requests();
        }

        let lock_key = keys::route_provision_lock(family_id);
        let handle = match self.lock.try_acquire(&lock_key, self.lock_ttl).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                if let Some(metrics) = &self.metrics {
                    metrics.increment_provision_requests_deduped();
                }
                info!(family_id, "provision request deduplicated, one already outstanding");
                return None;
            }
            Err(err) => {
                warn!(family_id, error = %err, "failed to acquire provision lock");
                return None;
            }
        };

        let Some((server_id, variant_id)) = self.candidate_server(family_id) else {
            let _ = self.lock.release(&handle).await;
            warn!(family_id, "no backend advertises spare capacity for family");
            return None;
        };

        let slot_id = format!("{family_id}-{}", Uuid::new_v4());
        self.servers.create_provisioning_slot(&server_id, &slot_id, family_id, variant_id.as_deref()).await?;
        self.held_locks.insert(family_id.to_string(), handle);

        let channel = server_player_route_channel(&server_id);
        let update = SlotStatusUpdate {
            server_id: server_id.clone(),
            slot_id: slot_id.clone(),
            status: crate::protocol::SlotStatus::Provisioning,
            online_players: 0,
            max_players: 0,
            metadata,
        };
        let bus = Arc::clone(&self.bus);
        let send_result = retry_provision_operation(
            "provisioner.send_request",
            || {
                let bus = Arc::clone(&bus);
                let channel = channel.clone();
                let update = update.clone();
                let target = server_id.clone();
                async move { bus.send(&target, &channel, BusMessage::SlotStatusUpdate(update)).await }
            },
            self.metrics.clone(),
        )
        .await;

        if let Err(err) = send_result {
            warn!(family_id, slot_id, error = %err, "failed to dispatch provision request to backend");
            self.release_provision_lock(family_id).await;
            return None;
        }

        info!(family_id, server_id, slot_id, "requested new slot provision");
        Some(ProvisionedSlot { server_id, slot_id })
    }

    /// Releases the outstanding provision lock for `family_id`, called
    /// once the new slot reports AVAILABLE (or its provisioning attempt is
    /// abandoned).
    pub async fn release_provision_lock(&self, family_id: &str) {
        if let Some((_, handle)) = self.held_locks.remove(family_id) {
            let _ = self.lock.release(&handle).await;
        }
    }
}
