//! In-process counters for the registries, heartbeat monitor and routing
//! coordinator. Exposition (a `/metrics` endpoint, a Prometheus exporter)
//! is out of scope for the core — these are consulted via `snapshot()` by
//! whatever operator tooling subscribes to the bus/KV, the same way the
//! rest of this codebase family keeps its counters independent of any one
//! transport.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counter_field {
    ($name:ident) => {
        pub fn $name(&self) -> u64 {
            self.$name.load(Ordering::Relaxed)
        }
    };
}

#[derive(Default)]
pub struct FulcrumMetrics {
    // C4/C5 registration
    proxies_registered: AtomicU64,
    proxies_deregistered: AtomicU64,
    proxies_reactivated: AtomicU64,
    servers_registered: AtomicU64,
    servers_deregistered: AtomicU64,

    // C7 heartbeat
    heartbeats_received: AtomicU64,
    heartbeats_rejected_blacklisted: AtomicU64,
    transitions_to_unavailable: AtomicU64,
    transitions_to_dead: AtomicU64,
    auto_restores: AtomicU64,

    // C8 provisioning
    provision_requests: AtomicU64,
    provision_requests_deduped: AtomicU64,

    // C9 routing
    routes_dispatched: AtomicU64,
    routes_acked_success: AtomicU64,
    routes_acked_failed: AtomicU64,
    routes_retried: AtomicU64,
    routes_disconnected: AtomicU64,
    requests_queued: AtomicU64,
    requests_queue_timeout: AtomicU64,
    reservation_timeouts: AtomicU64,

    // C10 shutdown
    shutdown_tickets_issued: AtomicU64,
    shutdown_tickets_consumed: AtomicU64,
    shutdown_tickets_rejected_reuse: AtomicU64,

    // ambient
    retry_attempts: AtomicU64,
    retry_successes: AtomicU64,
    kv_write_failures: AtomicU64,
}

impl FulcrumMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_proxies_registered(&self) {
        self.proxies_registered.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_proxies_deregistered(&self) {
        self.proxies_deregistered.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_proxies_reactivated(&self) {
        self.proxies_reactivated.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_servers_registered(&self) {
        self.servers_registered.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_servers_deregistered(&self) {
        self.servers_deregistered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_heartbeats_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_heartbeats_rejected_blacklisted(&self) {
        self.heartbeats_rejected_blacklisted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_transitions_to_unavailable(&self) {
        self.transitions_to_unavailable.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_transitions_to_dead(&self) {
        self.transitions_to_dead.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_auto_restores(&self) {
        self.auto_restores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_provision_requests(&self) {
        self.provision_requests.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_provision_requests_deduped(&self) {
        self.provision_requests_deduped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_routes_dispatched(&self) {
        self.routes_dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_routes_acked_success(&self) {
        self.routes_acked_success.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_routes_acked_failed(&self) {
        self.routes_acked_failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_routes_retried(&self) {
        self.routes_retried.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_routes_disconnected(&self) {
        self.routes_disconnected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_requests_queued(&self) {
        self.requests_queued.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_requests_queue_timeout(&self) {
        self.requests_queue_timeout.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_reservation_timeouts(&self) {
        self.reservation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_shutdown_tickets_issued(&self) {
        self.shutdown_tickets_issued.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_shutdown_tickets_consumed(&self) {
        self.shutdown_tickets_consumed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_shutdown_tickets_rejected_reuse(&self) {
        self.shutdown_tickets_rejected_reuse.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_attempts(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_retry_successes(&self) {
        self.retry_successes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn increment_kv_write_failures(&self) {
        self.kv_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    counter_field!(proxies_registered);
    counter_field!(servers_registered);
    counter_field!(routes_dispatched);
    counter_field!(routes_acked_success);
    counter_field!(routes_acked_failed);
    counter_field!(routes_retried);
    counter_field!(routes_disconnected);
    counter_field!(shutdown_tickets_issued);
    counter_field!(shutdown_tickets_consumed);
    counter_field!(kv_write_failures);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            registry: RegistrySnapshot {
                proxies_registered: self.proxies_registered.load(Ordering::Relaxed),
                proxies_deregistered: self.proxies_deregistered.load(Ordering::Relaxed),
                proxies_reactivated: self.proxies_reactivated.load(Ordering::Relaxed),
                servers_registered: self.servers_registered.load(Ordering::Relaxed),
                servers_deregistered: self.servers_deregistered.load(Ordering::Relaxed),
            },
            heartbeat: HeartbeatSnapshot {
                heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
                heartbeats_rejected_blacklisted: self.heartbeats_rejected_blacklisted.load(Ordering::Relaxed),
                transitions_to_unavailable: self.transitions_to_unavailable.load(Ordering::Relaxed),
                transitions_to_dead: self.transitions_to_dead.load(Ordering::Relaxed),
                auto_restores: self.auto_restores.load(Ordering::Relaxed),
            },
            routing: RoutingSnapshot {
                routes_dispatched: self.routes_dispatched.load(Ordering::Relaxed),
                routes_acked_success: self.routes_acked_success.load(Ordering::Relaxed),
                routes_acked_failed: self.routes_acked_failed.load(Ordering::Relaxed),
                routes_retried: self.routes_retried.load(Ordering::Relaxed),
                routes_disconnected: self.routes_disconnected.load(Ordering::Relaxed),
                requests_queued: self.requests_queued.load(Ordering::Relaxed),
                requests_queue_timeout: self.requests_queue_timeout.load(Ordering::Relaxed),
                reservation_timeouts: self.reservation_timeouts.load(Ordering::Relaxed),
            },
            provisioning: ProvisioningSnapshot {
                provision_requests: self.provision_requests.load(Ordering::Relaxed),
                provision_requests_deduped: self.provision_requests_deduped.load(Ordering::Relaxed),
            },
            shutdown: ShutdownSnapshot {
                tickets_issued: self.shutdown_tickets_issued.load(Ordering::Relaxed),
                tickets_consumed: self.shutdown_tickets_consumed.load(Ordering::Relaxed),
                tickets_rejected_reuse: self.shutdown_tickets_rejected_reuse.load(Ordering::Relaxed),
            },
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            retry_successes: self.retry_successes.load(Ordering::Relaxed),
            kv_write_failures: self.kv_write_failures.load(Ordering::Relaxed),
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        let dispatched = self.routes_dispatched.load(Ordering::Relaxed);
        let failed = self.routes_acked_failed.load(Ordering::Relaxed);
        let mut issues = Vec::new();

        if dispatched > 0 {
            let failure_rate = failed as f64 / dispatched as f64;
            if failure_rate > 0.5 {
                issues.push(format!("route ack failure rate {:.0}%", failure_rate * 100.0));
            }
        }
        if self.kv_write_failures.load(Ordering::Relaxed) > 0 {
            issues.push("kv mirror write failures observed".to_string());
        }

        let level = if issues.is_empty() { HealthStatusLevel::Healthy } else { HealthStatusLevel::Degraded };
        HealthStatus { level, issues }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub proxies_registered: u64,
    pub proxies_deregistered: u64,
    pub proxies_reactivated: u64,
    pub servers_registered: u64,
    pub servers_deregistered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub heartbeats_received: u64,
    pub heartbeats_rejected_blacklisted: u64,
    pub transitions_to_unavailable: u64,
    pub transitions_to_dead: u64,
    pub auto_restores: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub routes_dispatched: u64,
    pub routes_acked_success: u64,
    pub routes_acked_failed: u64,
    pub routes_retried: u64,
    pub routes_disconnected: u64,
    pub requests_queued: u64,
    pub requests_queue_timeout: u64,
    pub reservation_timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSnapshot {
    pub provision_requests: u64,
    pub provision_requests_deduped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSnapshot {
    pub tickets_issued: u64,
    pub tickets_consumed: u64,
    pub tickets_rejected_reuse: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub registry: RegistrySnapshot,
    pub heartbeat: HeartbeatSnapshot,
    pub routing: RoutingSnapshot,
    pub provisioning: ProvisioningSnapshot,
    pub shutdown: ShutdownSnapshot,
    pub retry_attempts: u64,
    pub retry_successes: u64,
    pub kv_write_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatusLevel {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub level: HealthStatusLevel,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = FulcrumMetrics::new();
        metrics.increment_proxies_registered();
        metrics.increment_routes_dispatched();
        metrics.increment_routes_acked_success();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.registry.proxies_registered, 1);
        assert_eq!(snapshot.routing.routes_dispatched, 1);
        assert_eq!(snapshot.routing.routes_acked_success, 1);
    }

    #[test]
    fn health_status_degrades_on_high_failure_rate() {
        let metrics = FulcrumMetrics::new();
        for _ in 0..10 {
            metrics.increment_routes_dispatched();
        }
        for _ in 0..6 {
            metrics.increment_routes_acked_failed();
        }
        let status = metrics.health_status();
        assert_eq!(status.level, HealthStatusLevel::Degraded);
        assert!(!status.issues.is_empty());
    }

    #[test]
    fn health_status_is_healthy_with_no_activity() {
        let metrics = FulcrumMetrics::new();
        assert_eq!(metrics.health_status().level, HealthStatusLevel::Healthy);
    }
}
