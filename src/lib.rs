#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::similar_names
)]

//! # Fulcrum
//!
//! A bus-driven control plane for a proxy/backend game network: proxy and
//! server registration, heartbeat liveness, on-demand slot provisioning,
//! player routing, evacuation, network configuration broadcasts and the
//! friends graph all live behind one message bus and one KV mirror.
//!
//! No external message broker or database is required to run this crate —
//! [`bus::InMemoryBus`] and [`kv::InMemoryKv`] back a real deployment the
//! same way they back its test suite; swapping either for a durable
//! implementation is a matter of implementing [`bus::Bus`] / [`kv::Kv`].

/// The message bus abstraction every component communicates through.
pub mod bus;

/// Server configuration and environment variables.
pub mod config;

/// Top-level orchestration wiring every component to the bus.
pub mod core;

/// Distributed locking (in-memory implementation).
pub mod distributed;

/// Heartbeat monitor: liveness classification and auto-re-registration.
pub mod heartbeat;

/// Proxy/server identifier allocation.
pub mod ids;

/// Persistent registry mirror.
pub mod kv;

/// Structured logging configuration.
pub mod logging;

/// Metrics collection and reporting.
pub mod metrics;

/// Network profile store and rank broadcast relay.
pub mod network_profile;

/// Protocol message catalog and shared data model.
pub mod protocol;

/// On-demand slot provisioning.
pub mod provisioner;

/// Rate limiting implementation.
pub mod rate_limit;

/// Proxy and server registries.
pub mod registry;

/// Retry logic utilities.
pub mod retry;

/// Player routing coordinator.
pub mod routing;

/// Shutdown / evacuation coordinator.
pub mod shutdown;

/// Registration state machine.
pub mod statemachine;

/// Friends/social mutation router.
pub mod social;
