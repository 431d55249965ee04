//! Persistent registry mirror (C6). Every registry/routing/heartbeat/
//! shutdown mutation is written through to this trait using the key
//! layout below; on boot each component loads its mirror before
//! subscribing to any bus channel (enforced by call order in
//! [`crate::core::FulcrumCore::new`], not by this module).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    #[error("stored value for key `{0}` could not be decoded: {1}")]
    Decode(String, String),
}

#[async_trait]
pub trait Kv: Send + Sync {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    /// Every stored key with the given prefix, used to rebuild a
    /// component's in-memory state on boot.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, KvError>;
}

#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, serde_json::Value>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for InMemoryKv {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), KvError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, KvError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>, KvError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}

/// Convenience helpers for components that always round-trip one typed
/// value per key, matching the serde-derived structs used on the bus.
pub async fn put_typed<T: Serialize + Sync>(kv: &dyn Kv, key: &str, value: &T) -> Result<(), KvError> {
    let json = serde_json::to_value(value)
        .map_err(|e| KvError::Decode(key.to_string(), e.to_string()))?;
    kv.put(key, json).await
}

pub async fn get_typed<T: DeserializeOwned>(kv: &dyn Kv, key: &str) -> Result<Option<T>, KvError> {
    match kv.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| KvError::Decode(key.to_string(), e.to_string())),
        None => Ok(None),
    }
}

pub mod keys {
    pub fn proxy_active(id: &str) -> String {
        format!("proxy:active:{id}")
    }
    pub fn proxy_unavailable(id: &str) -> String {
        format!("proxy:unavailable:{id}")
    }
    pub fn proxy_unavailable_ts(id: &str) -> String {
        format!("proxy:unavailable:{id}:ts")
    }
    pub fn proxy_temp(temp_id: &str) -> String {
        format!("proxy:temp:{temp_id}")
    }
    pub fn server_active(id: &str) -> String {
        format!("server:active:{id}")
    }
    pub fn server_slots(server_id: &str) -> String {
        format!("server:slots:{server_id}")
    }
    pub fn server_unavailable(id: &str) -> String {
        format!("server:unavailable:{id}")
    }
    pub fn heartbeat_server(id: &str) -> String {
        format!("heartbeat:server:{id}")
    }
    pub fn heartbeat_proxy(id: &str) -> String {
        format!("heartbeat:proxy:{id}")
    }
    pub fn heartbeat_dead_server(id: &str) -> String {
        format!("heartbeat:dead:server:{id}")
    }
    pub fn heartbeat_dead_proxy(id: &str) -> String {
        format!("heartbeat:dead:proxy:{id}")
    }
    pub fn route_queue(family: &str) -> String {
        format!("route:queue:{family}")
    }
    pub fn route_inflight(request_id: &str) -> String {
        format!("route:inflight:{request_id}")
    }
    pub fn route_occupancy(slot_id: &str) -> String {
        format!("route:occupancy:{slot_id}")
    }
    pub fn route_active_player(player_id: &str) -> String {
        format!("route:active:player:{player_id}")
    }
    pub fn route_active_player_recent(player_id: &str) -> String {
        format!("route:active:player:{player_id}:recent")
    }
    pub fn route_provision_lock(family: &str) -> String {
        format!("route:provision-lock:{family}")
    }
    pub fn party_reservation(id: &str) -> String {
        format!("party:reservation:{id}")
    }
    pub fn match_roster(slot_id: &str) -> String {
        format!("match:roster:{slot_id}")
    }
    pub fn shutdown_intent(id: &str) -> String {
        format!("shutdown:intent:{id}")
    }
    pub fn shutdown_ticket(player_id: &str, intent_id: &str) -> String {
        format!("shutdown:ticket:{player_id}:{intent_id}")
    }
    pub fn network_profile_active() -> &'static str {
        "network:profile:active"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_typed_values() {
        let kv = InMemoryKv::new();
        put_typed(&kv, "proxy:active:1", &42u64).await.unwrap();
        let value: Option<u64> = get_typed(&kv, "proxy:active:1").await.unwrap();
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn scan_prefix_finds_only_matching_keys() {
        let kv = InMemoryKv::new();
        kv.put("proxy:active:1", serde_json::json!(1)).await.unwrap();
        kv.put("proxy:active:2", serde_json::json!(2)).await.unwrap();
        kv.put("server:active:1", serde_json::json!(3)).await.unwrap();

        let matches = kv.scan_prefix("proxy:active:").await.unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let kv = InMemoryKv::new();
        kv.put("k", serde_json::json!("v")).await.unwrap();
        kv.delete("k").await.unwrap();
        assert!(kv.get("k").await.unwrap().is_none());
    }
}
