use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

use crate::ids::{parse_numeric_suffix, IdAllocator, IdKind};
use crate::kv::{self, keys, Kv};
use crate::protocol::{NodeStatus, RegisteredProxy};

use super::{CLEANUP_INTERVAL, DEBOUNCE_WINDOW, RECYCLE_WINDOW};

struct Unavailable {
    proxy: RegisteredProxy,
    since: chrono::DateTime<Utc>,
}

/// Registry of edge proxies. Reads (`get`, `by_address`, `list_active`) hit
/// the `DashMap` directly; every mutating operation is serialized behind
/// `mutation_lock` so the multi-step register/deregister logic in §4.4
/// runs as a single atomic unit.
pub struct ProxyRegistry {
    active: DashMap<String, RegisteredProxy>,
    unavailable: DashMap<String, Unavailable>,
    mutation_lock: Mutex<()>,
    ids: Arc<IdAllocator>,
    kv: Arc<dyn Kv>,
}

impl ProxyRegistry {
    pub fn new(ids: Arc<IdAllocator>, kv: Arc<dyn Kv>) -> Arc<Self> {
        debug_assert_eq!(ids.kind(), IdKind::Proxy);
        Arc::new(Self {
            active: DashMap::new(),
            unavailable: DashMap::new(),
            mutation_lock: Mutex::new(()),
            ids,
            kv,
        })
    }

    /// Rebuilds the active and unavailable pools from their KV mirrors and
    /// re-reserves every restored id with the allocator, called once on
    /// boot before this registry's owner subscribes to any bus channel.
    pub async fn load_from_kv(&self) {
        if let Ok(entries) = self.kv.scan_prefix("proxy:active:").await {
            for (key, value) in entries {
                match serde_json::from_value::<RegisteredProxy>(value) {
                    Ok(proxy) => {
                        self.ids.reserve_existing(proxy.id.0).await;
                        self.active.insert(proxy.id.canonical(), proxy);
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted active proxy"),
                }
            }
        }
        if let Ok(entries) = self.kv.scan_prefix("proxy:unavailable:").await {
            for (key, value) in entries {
                if key.ends_with(":ts") {
                    continue;
                }
                match serde_json::from_value::<RegisteredProxy>(value) {
                    Ok(proxy) => {
                        self.ids.reserve_existing(proxy.id.0).await;
                        self.unavailable.insert(proxy.id.canonical(), Unavailable { proxy, since: Utc::now() });
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted unavailable proxy"),
                }
            }
        }
    }

    pub fn get(&self, proxy_id: &str) -> Option<RegisteredProxy> {
        self.active.get(proxy_id).map(|e| e.clone())
    }

    pub fn by_address(&self, address: &str, port: u16) -> Option<RegisteredProxy> {
        self.active
            .iter()
            .find(|e| e.address == address && e.port == port)
            .map(|e| e.clone())
    }

    pub fn list_active(&self) -> Vec<RegisteredProxy> {
        self.active.iter().map(|e| e.clone()).collect()
    }

    pub fn is_known(&self, proxy_id: &str) -> bool {
        self.active.contains_key(proxy_id) || self.unavailable.contains_key(proxy_id)
    }

    async fn mirror_active(&self, proxy: &RegisteredProxy) {
        if let Err(err) = kv::put_typed(self.kv.as_ref(), &keys::proxy_active(&proxy.id.canonical()), proxy).await {
            warn!(proxy_id = %proxy.id, error = %err, "failed to mirror proxy registration to kv");
        }
    }

    /// §4.4 `register`. `proxy_id` is `Some` when the proxy is announcing a
    /// previously-assigned id (e.g. after a reconnect); `None` allocates a
    /// fresh one.
    pub async fn register(&self, proxy_id: Option<&str>, address: &str, port: u16) -> RegisteredProxy {
        let _guard = self.mutation_lock.lock().await;

        if let Some(id) = proxy_id {
            if let Some(existing) = self.active.get(id) {
                return existing.clone();
            }
        }

        if let Some(existing) = self.by_address(address, port) {
            if Utc::now().signed_duration_since(existing.registered_at).to_std().unwrap_or(DEBOUNCE_WINDOW)
                < DEBOUNCE_WINDOW
            {
                info!(proxy_id = %existing.id, address, port, "debounced duplicate proxy announcement");
                return existing;
            }
        }

        if let Some(id) = proxy_id {
            if let Some((_, unavailable)) = self.unavailable.remove(id) {
                let mut proxy = unavailable.proxy;
                proxy.status = NodeStatus::Available;
                proxy.last_heartbeat = Utc::now();
                proxy.address = address.to_string();
                proxy.port = port;
                self.active.insert(id.to_string(), proxy.clone());
                self.mirror_active(&proxy).await;
                info!(proxy_id = %proxy.id, "reactivated proxy from unavailable pool");
                return proxy;
            }
        }

        let new_id = self.ids.allocate().await;
        let now = Utc::now();
        let numeric = parse_numeric_suffix(&new_id, IdKind::Proxy).expect("allocator returns canonical ids");
        let proxy = RegisteredProxy {
            id: crate::protocol::ProxyIdentifier(numeric),
            address: address.to_string(),
            port,
            last_heartbeat: now,
            status: NodeStatus::Available,
            registered_at: now,
        };
        self.active.insert(new_id, proxy.clone());
        self.mirror_active(&proxy).await;
        info!(proxy_id = %proxy.id, address, port, "registered new proxy");
        proxy
    }

    /// §4.4 `deregister`: move to the unavailable pool, id stays reserved
    /// for the recycle window.
    pub async fn deregister(&self, proxy_id: &str) {
        let _guard = self.mutation_lock.lock().await;
        let Some((_, proxy)) = self.active.remove(proxy_id) else {
            return;
        };
        let since = Utc::now();
        if let Err(err) = self.kv.delete(&keys::proxy_active(proxy_id)).await {
            warn!(proxy_id, error = %err, "failed to clear active proxy kv entry");
        }
        if let Err(err) = kv::put_typed(self.kv.as_ref(), &keys::proxy_unavailable(proxy_id), &proxy).await {
            warn!(proxy_id, error = %err, "failed to mirror unavailable proxy to kv");
        }
        self.unavailable.insert(proxy_id.to_string(), Unavailable { proxy, since });
        info!(proxy_id, "deregistered proxy into unavailable pool");
    }

    /// §4.4 `reactivate`: heartbeat arriving for a proxy currently parked
    /// in the unavailable pool.
    pub async fn reactivate(&self, proxy_id: &str) -> Option<RegisteredProxy> {
        let _guard = self.mutation_lock.lock().await;
        let (_, unavailable) = self.unavailable.remove(proxy_id)?;
        let mut proxy = unavailable.proxy;
        proxy.status = NodeStatus::Available;
        proxy.last_heartbeat = Utc::now();
        self.active.insert(proxy_id.to_string(), proxy.clone());
        let _ = self.kv.delete(&keys::proxy_unavailable(proxy_id)).await;
        self.mirror_active(&proxy).await;
        info!(proxy_id, "reactivated proxy on heartbeat");
        Some(proxy)
    }

    /// Moves an active proxy straight into the unavailable pool, used by
    /// the heartbeat monitor when a node is declared DEAD.
    pub async fn mark_dead(&self, proxy_id: &str) {
        self.deregister(proxy_id).await;
    }

    /// Refreshes `lastHeartbeat` and flips status back to AVAILABLE for an
    /// active proxy. Used by the heartbeat monitor (C7) on every accepted
    /// heartbeat.
    pub async fn record_heartbeat(&self, proxy_id: &str) -> bool {
        let Some(mut entry) = self.active.get_mut(proxy_id) else {
            return false;
        };
        entry.last_heartbeat = Utc::now();
        entry.status = NodeStatus::Available;
        true
    }

    pub fn set_status(&self, proxy_id: &str, status: NodeStatus) {
        if let Some(mut entry) = self.active.get_mut(proxy_id) {
            entry.status = status;
        }
    }

    /// §4.4 `removeImmediately`: bypasses the recycle window entirely.
    pub async fn remove_immediately(&self, proxy_id: &str) {
        let _guard = self.mutation_lock.lock().await;
        self.active.remove(proxy_id);
        if let Some((_, numeric)) = self.unavailable.remove(proxy_id).map(|(id, u)| (id, u.proxy.id.0)) {
            self.ids.release(numeric, true).await;
        } else if let Some(n) = parse_numeric_suffix(proxy_id, IdKind::Proxy) {
            self.ids.release(n, true).await;
        }
        let _ = self.kv.delete(&keys::proxy_active(proxy_id)).await;
        let _ = self.kv.delete(&keys::proxy_unavailable(proxy_id)).await;
        info!(proxy_id, "removed proxy immediately, bypassing recycle window");
    }

    /// §4.4 cleanup loop: permanently drop unavailable entries whose
    /// recycle window has elapsed and release their ids.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .unavailable
            .iter()
            .filter(|e| now.signed_duration_since(e.since).to_std().unwrap_or_default() >= RECYCLE_WINDOW)
            .map(|e| e.key().clone())
            .collect();

        for proxy_id in expired {
            if let Some((_, entry)) = self.unavailable.remove(&proxy_id) {
                self.ids.release(entry.proxy.id.0, false).await;
                let _ = self.kv.delete(&keys::proxy_unavailable(&proxy_id)).await;
                info!(proxy_id, "released proxy id after recycle window elapsed");
            }
        }
    }

    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                this.sweep_expired().await;
            }
        })
    }
}
