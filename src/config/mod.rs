//! Configuration module for Fulcrum.
//!
//! This module provides layered configuration management with support for:
//! - JSON configuration files
//! - Environment variable overrides (`FULCRUM__SECTION__FIELD`)
//! - Stdin input
//! - Sensible defaults
//!
//! # Module Structure
//!
//! - [`types`]: Root [`Config`] struct and its per-component sections
//! - [`logging`]: Logging configuration, shared verbatim with [`crate::logging`]
//! - [`defaults`]: Default value functions backing every `serde(default = ...)`
//! - [`loader`]: Layered configuration loading

pub mod defaults;
pub mod loader;
pub mod logging;
pub mod types;

pub use loader::load;
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use types::{
    BusBackend, BusConfig, Config, HeartbeatConfig, IdConfig, KvBackend, KvConfig,
    ProvisionerConfig, RegistryConfig, RoutingConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();

        assert_eq!(config.ids.release_window_secs, 300);
        assert_eq!(config.heartbeat.dead_timeout_secs, 30);
        assert_eq!(config.routing.route_timeout_secs, 15);

        assert_eq!(config.logging.dir, "logs");
        assert_eq!(config.logging.filename, "fulcrum.log");
        assert_eq!(config.logging.rotation, "daily");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.provisioner.provision_lock_ttl_secs,
            deserialized.provisioner.provision_lock_ttl_secs
        );
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogLevel::Info.to_string(), "info");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_log_level_as_str() {
        assert_eq!(LogLevel::Trace.as_str(), "trace");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }
}
