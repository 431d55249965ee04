//! Default value functions for configuration fields.
//!
//! This module contains all the default value functions used by serde's `#[serde(default = ...)]`
//! attributes throughout the configuration system. Functions are organized by category for
//! easier maintenance. Every value here matches the constant of the same purpose documented
//! in the core's component modules; the two are not read from one another because several of
//! the durations are baked into `const` tables that the config layer can only override at the
//! call sites that accept an explicit parameter (id release window, provision lock TTL).

use super::types::{BusBackend, KvBackend};

// =============================================================================
// Root
// =============================================================================

pub const fn default_bus_kind() -> BusBackend {
    BusBackend::InMemory
}

pub const fn default_kv_kind() -> KvBackend {
    KvBackend::InMemory
}

// =============================================================================
// Id allocation (§4.2)
// =============================================================================

pub const fn default_id_release_window_secs() -> u64 {
    300
}

// =============================================================================
// Heartbeat monitor (§4.7)
// =============================================================================

pub const fn default_unavailable_timeout_secs() -> u64 {
    5
}

pub const fn default_dead_timeout_secs() -> u64 {
    30
}

pub const fn default_check_interval_secs() -> u64 {
    1
}

pub const fn default_grace_period_secs() -> u64 {
    10
}

pub const fn default_dead_blacklist_secs() -> u64 {
    60
}

// =============================================================================
// Registry (§4.4/§4.5)
// =============================================================================

pub const fn default_recycle_window_secs() -> u64 {
    300
}

pub const fn default_debounce_window_secs() -> u64 {
    30
}

pub const fn default_cleanup_interval_secs() -> u64 {
    60
}

// =============================================================================
// Routing coordinator (§4.9)
// =============================================================================

pub const fn default_route_timeout_secs() -> u64 {
    15
}

pub const fn default_reservation_timeout_secs() -> u64 {
    5
}

pub const fn default_max_queue_wait_secs() -> u64 {
    45
}

pub const fn default_recent_slot_ttl_secs() -> u64 {
    45
}

// =============================================================================
// Slot provisioner (§4.8)
// =============================================================================

pub const fn default_provision_lock_ttl_secs() -> u64 {
    30
}

// =============================================================================
// Logging
// =============================================================================

pub fn default_log_dir() -> String {
    "logs".to_string()
}

pub fn default_log_filename() -> String {
    "fulcrum.log".to_string()
}

pub fn default_rotation() -> String {
    "daily".to_string()
}

pub const fn default_enable_file_logging() -> bool {
    true
}

pub const fn default_log_format() -> super::logging::LogFormat {
    super::logging::LogFormat::Json
}
