//! Per-player active-slot and recent-slot bookkeeping (§4.9.1 step 4,
//! §4.9.7). Recent-slot memory stops a player from being immediately
//! re-routed to a slot they just left.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::kv::{self, keys, Kv};
use crate::routing::RECENT_SLOT_TTL;

const MAX_RECENT_SLOTS: usize = 3;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct RecentSlot {
    slot_id: String,
    assigned_at: DateTime<Utc>,
}

pub struct PlayerSlotTracker {
    active: DashMap<String, String>,
    recent: DashMap<String, VecDeque<RecentSlot>>,
    kv: Arc<dyn Kv>,
}

impl PlayerSlotTracker {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { active: DashMap::new(), recent: DashMap::new(), kv }
    }

    /// Rebuilds the active-slot map from its KV mirror, called once on
    /// boot before the coordinator subscribes to any bus channel. Recent
    /// slot memory is not mirrored — it is a soft anti-reroute hint, not
    /// state that must survive a restart.
    pub async fn load_from_kv(&self) {
        let Ok(entries) = self.kv.scan_prefix("route:active:player:").await else {
            return;
        };
        for (key, value) in entries {
            if key.ends_with(":recent") {
                continue;
            }
            let player_id = key.trim_start_matches("route:active:player:").to_string();
            match serde_json::from_value::<String>(value) {
                Ok(slot_id) => {
                    self.active.insert(player_id, slot_id);
                }
                Err(err) => tracing::warn!(key, error = %err, "failed to decode persisted active slot"),
            }
        }
    }

    pub fn active_slot(&self, player_id: &str) -> Option<String> {
        self.active.get(player_id).map(|e| e.clone())
    }

    /// Every player currently holding an active slot, used to ticket
    /// online players for a shutdown evacuation (§4.10).
    pub fn all_active_player_ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Records `slot_id` as the player's new active slot, evicting the
    /// previous one into recent-slot memory.
    pub async fn record_assignment(&self, player_id: &str, slot_id: &str) {
        if let Some((_, previous)) = self.active.remove(player_id) {
            self.push_recent(player_id, &previous);
        }
        self.active.insert(player_id.to_string(), slot_id.to_string());
        self.persist(player_id).await;
    }

    fn push_recent(&self, player_id: &str, slot_id: &str) {
        let mut entry = self.recent.entry(player_id.to_string()).or_default();
        entry.push_back(RecentSlot { slot_id: slot_id.to_string(), assigned_at: Utc::now() });
        while entry.len() > MAX_RECENT_SLOTS {
            entry.pop_front();
        }
    }

    /// Ids to block for the player's next route: current slot, and every
    /// recent slot still within `RECENT_SLOT_TTL`.
    pub fn blocked_slot_ids(&self, player_id: &str) -> Vec<String> {
        let now = Utc::now();
        let mut blocked: Vec<String> = self.active_slot(player_id).into_iter().collect();
        if let Some(entry) = self.recent.get(player_id) {
            blocked.extend(
                entry
                    .iter()
                    .filter(|r| now.signed_duration_since(r.assigned_at).to_std().unwrap_or_default() < RECENT_SLOT_TTL)
                    .map(|r| r.slot_id.clone()),
            );
        }
        blocked
    }

    async fn persist(&self, player_id: &str) {
        if let Some(slot_id) = self.active_slot(player_id) {
            let _ = kv::put_typed(self.kv.as_ref(), &keys::route_active_player(player_id), &slot_id).await;
        }
    }

    pub fn clear_active(&self, player_id: &str) {
        self.active.remove(player_id);
    }

    pub fn cleanup_stale(&self, max_age: Duration) {
        let now = Utc::now();
        for mut entry in self.recent.iter_mut() {
            entry.retain(|r| now.signed_duration_since(r.assigned_at).to_std().unwrap_or_default() < max_age);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn active_slot_is_blocked_after_assignment() {
        let tracker = PlayerSlotTracker::new(Arc::new(InMemoryKv::new()));
        tracker.record_assignment("p1", "lobby:1").await;
        assert_eq!(tracker.active_slot("p1"), Some("lobby:1".to_string()));
        assert!(tracker.blocked_slot_ids("p1").contains(&"lobby:1".to_string()));
    }

    #[tokio::test]
    async fn previous_slot_moves_into_recent_memory() {
        let tracker = PlayerSlotTracker::new(Arc::new(InMemoryKv::new()));
        tracker.record_assignment("p1", "lobby:1").await;
        tracker.record_assignment("p1", "lobby:2").await;
        let blocked = tracker.blocked_slot_ids("p1");
        assert!(blocked.contains(&"lobby:1".to_string()));
        assert!(blocked.contains(&"lobby:2".to_string()));
    }

    #[tokio::test]
    async fn recent_memory_caps_at_three_entries() {
        let tracker = PlayerSlotTracker::new(Arc::new(InMemoryKv::new()));
        for i in 0..5 {
            tracker.record_assignment("p1", &format!("lobby:{i}")).await;
        }
        let entry = tracker.recent.get("p1").unwrap();
        assert_eq!(entry.len(), MAX_RECENT_SLOTS);
    }
}
