//! §4.9.3 per-family queueing, persisted in the KV mirror so a restart
//! does not silently drop players already waiting.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::kv::{self, keys, Kv};
use crate::protocol::PlayerRequestContext;

pub struct RouteQueue {
    families: DashMap<String, VecDeque<PlayerRequestContext>>,
    kv: Arc<dyn Kv>,
}

impl RouteQueue {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { families: DashMap::new(), kv }
    }

    /// Rebuilds every family queue from its KV mirror, called once on
    /// boot before the coordinator subscribes to any bus channel.
    pub async fn load_from_kv(&self) {
        let Ok(entries) = self.kv.scan_prefix("route:queue:").await else {
            return;
        };
        for (key, value) in entries {
            let family = key.trim_start_matches("route:queue:").to_string();
            match serde_json::from_value::<Vec<PlayerRequestContext>>(value) {
                Ok(contexts) => {
                    self.families.insert(family, contexts.into_iter().collect());
                }
                Err(err) => warn!(key, error = %err, "failed to decode persisted route queue"),
            }
        }
    }

    pub async fn enqueue(&self, family: &str, mut ctx: PlayerRequestContext) {
        ctx.touch_enqueued();
        self.families.entry(family.to_string()).or_default().push_back(ctx);
        self.persist(family).await;
    }

    pub fn len(&self, family: &str) -> usize {
        self.families.get(family).map(|q| q.len()).unwrap_or(0)
    }

    pub fn families(&self) -> Vec<String> {
        self.families.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes and returns every queued entry for `family` whose wait has
    /// exceeded `max_wait` as of `now`.
    pub fn take_timed_out(&self, family: &str, now: DateTime<Utc>, max_wait: Duration) -> Vec<PlayerRequestContext> {
        let Some(mut queue) = self.families.get_mut(family) else {
            return Vec::new();
        };
        let mut timed_out = Vec::new();
        queue.retain(|ctx| {
            let waited = now.signed_duration_since(ctx.created_at).to_std().unwrap_or_default();
            if waited >= max_wait {
                timed_out.push(ctx.clone());
                false
            } else {
                true
            }
        });
        timed_out
    }

    /// Pops every entry currently queued for `family` for a drain pass;
    /// the caller re-enqueues whatever it could not route.
    pub fn drain_all(&self, family: &str) -> Vec<PlayerRequestContext> {
        self.families.get_mut(family).map(|mut q| q.drain(..).collect()).unwrap_or_default()
    }

    pub async fn persist(&self, family: &str) {
        let snapshot: Vec<PlayerRequestContext> =
            self.families.get(family).map(|q| q.iter().cloned().collect()).unwrap_or_default();
        if snapshot.is_empty() {
            let _ = self.kv.delete(&keys::route_queue(family)).await;
        } else if let Err(err) = kv::put_typed(self.kv.as_ref(), &keys::route_queue(family), &snapshot).await {
            warn!(family, error = %err, "failed to persist route queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::protocol::PlayerRequest;
    use std::collections::HashMap;

    fn ctx(id: &str) -> PlayerRequestContext {
        PlayerRequestContext::new(PlayerRequest {
            request_id: id.to_string(),
            player_id: id.to_string(),
            player_name: id.to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            family_id: "lobby".to_string(),
            metadata: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn enqueue_then_drain_preserves_order() {
        let queue = RouteQueue::new(Arc::new(InMemoryKv::new()));
        queue.enqueue("lobby", ctx("p1")).await;
        queue.enqueue("lobby", ctx("p2")).await;
        let drained = queue.drain_all("lobby");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].request.player_id, "p1");
    }

    #[tokio::test]
    async fn take_timed_out_removes_only_expired_entries() {
        let queue = RouteQueue::new(Arc::new(InMemoryKv::new()));
        queue.enqueue("lobby", ctx("p1")).await;
        let timed_out = queue.take_timed_out("lobby", Utc::now() + chrono::Duration::seconds(60), Duration::from_secs(45));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(queue.len("lobby"), 0);
    }
}
