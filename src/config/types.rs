//! Root configuration types.

use serde::{Deserialize, Serialize};

use super::defaults::{
    default_bus_kind, default_check_interval_secs, default_cleanup_interval_secs,
    default_dead_blacklist_secs, default_dead_timeout_secs, default_debounce_window_secs,
    default_grace_period_secs, default_id_release_window_secs, default_kv_kind,
    default_max_queue_wait_secs, default_provision_lock_ttl_secs, default_recent_slot_ttl_secs,
    default_recycle_window_secs, default_reservation_timeout_secs, default_route_timeout_secs,
    default_unavailable_timeout_secs,
};
use super::logging::LoggingConfig;

/// Root configuration for the Fulcrum core binary.
///
/// Fields are filled in with their defaults by `serde(default = ...)` so a
/// config file only needs to specify the values it wants to override.
/// The core has no network surface of its own — every field here tunes
/// the bus/KV-facing components, not a listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub kv: KvConfig,

    #[serde(default)]
    pub ids: IdConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub provisioner: ProvisionerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            kv: KvConfig::default(),
            ids: IdConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            registry: RegistryConfig::default(),
            routing: RoutingConfig::default(),
            provisioner: ProvisionerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Which [`crate::bus::Bus`] implementation backs the control plane.
///
/// Only `in-memory` is implemented; the field exists so a durable broker
/// backend can be selected by configuration alone once one is wired in,
/// the same way [`KvBackend`] anticipates a durable KV store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BusBackend {
    #[default]
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KvBackend {
    #[default]
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    #[serde(default = "default_bus_kind")]
    pub backend: BusBackend,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { backend: default_bus_kind() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    #[serde(default = "default_kv_kind")]
    pub backend: KvBackend,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self { backend: default_kv_kind() }
    }
}

/// Id-allocation tuning (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    /// How long a released numeric id is withheld from reallocation.
    #[serde(default = "default_id_release_window_secs")]
    pub release_window_secs: u64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self { release_window_secs: default_id_release_window_secs() }
    }
}

/// Heartbeat monitor thresholds (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(default = "default_unavailable_timeout_secs")]
    pub unavailable_timeout_secs: u64,
    #[serde(default = "default_dead_timeout_secs")]
    pub dead_timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_dead_blacklist_secs")]
    pub dead_blacklist_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            unavailable_timeout_secs: default_unavailable_timeout_secs(),
            dead_timeout_secs: default_dead_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            dead_blacklist_secs: default_dead_blacklist_secs(),
        }
    }
}

/// Proxy/server registry tuning (§4.4/§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(default = "default_recycle_window_secs")]
    pub recycle_window_secs: u64,
    #[serde(default = "default_debounce_window_secs")]
    pub debounce_window_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            recycle_window_secs: default_recycle_window_secs(),
            debounce_window_secs: default_debounce_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Player routing coordinator tuning (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    #[serde(default = "default_route_timeout_secs")]
    pub route_timeout_secs: u64,
    #[serde(default = "default_reservation_timeout_secs")]
    pub reservation_timeout_secs: u64,
    #[serde(default = "default_max_queue_wait_secs")]
    pub max_queue_wait_secs: u64,
    #[serde(default = "default_recent_slot_ttl_secs")]
    pub recent_slot_ttl_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            route_timeout_secs: default_route_timeout_secs(),
            reservation_timeout_secs: default_reservation_timeout_secs(),
            max_queue_wait_secs: default_max_queue_wait_secs(),
            recent_slot_ttl_secs: default_recent_slot_ttl_secs(),
        }
    }
}

/// Slot provisioner tuning (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    #[serde(default = "default_provision_lock_ttl_secs")]
    pub provision_lock_ttl_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self { provision_lock_ttl_secs: default_provision_lock_ttl_secs() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = Config::default();
        assert_eq!(config.ids.release_window_secs, 300);
        assert_eq!(config.heartbeat.unavailable_timeout_secs, 5);
        assert_eq!(config.heartbeat.dead_timeout_secs, 30);
        assert_eq!(config.routing.route_timeout_secs, 15);
        assert_eq!(config.provisioner.provision_lock_ttl_secs, 30);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(
            config.registry.recycle_window_secs,
            deserialized.registry.recycle_window_secs
        );
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"heartbeat": {"dead_timeout_secs": 90}}"#).unwrap();
        assert_eq!(config.heartbeat.dead_timeout_secs, 90);
        assert_eq!(config.heartbeat.grace_period_secs, 10);
    }
}
