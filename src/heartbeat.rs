//! Heartbeat monitor (C7): classifies every registered proxy/server into
//! AVAILABLE/UNAVAILABLE/DEAD from heartbeat recency, drives the
//! registration state machine's auto-re-registration edge, and owns the
//! dead-node snapshot + blacklist used to refuse a stale node's heartbeats
//! and later auto-restore it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::bus::SharedBus;
use crate::kv::{self, keys, Kv};
use crate::metrics::FulcrumMetrics;
use crate::protocol::messages::{
    HeartbeatMessage, RegistryReregRequest, ServerRemoval, StatusChangeMessage, CH_REGISTRY_REREG_REQUEST,
    CH_SERVER_REMOVAL, CH_STATUS_CHANGE,
};
use crate::protocol::{BusMessage, NodeStatus, RegisteredProxy, RegisteredServer, RegistrationState};
use crate::rate_limit::NodeWarningLimiter;
use crate::registry::{ProxyRegistry, ServerRegistry};
use crate::statemachine::StateMachine;

pub const UNAVAILABLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEAD_BLACKLIST: Duration = Duration::from_secs(60);

fn is_proxy_id(node_id: &str) -> bool {
    node_id.starts_with("fulcrum-proxy-")
}

pub struct HeartbeatMonitor {
    proxies: Arc<ProxyRegistry>,
    servers: Arc<ServerRegistry>,
    kv: Arc<dyn Kv>,
    bus: SharedBus,
    metrics: Option<Arc<FulcrumMetrics>>,
    warnings: Arc<NodeWarningLimiter>,
    states: DashMap<String, Arc<StateMachine>>,
    blacklist: DashMap<String, DateTime<Utc>>,
}

impl HeartbeatMonitor {
    pub fn new(
        proxies: Arc<ProxyRegistry>,
        servers: Arc<ServerRegistry>,
        kv: Arc<dyn Kv>,
        bus: SharedBus,
        metrics: Option<Arc<FulcrumMetrics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxies,
            servers,
            kv,
            bus,
            metrics,
            warnings: Arc::new(NodeWarningLimiter::new(Default::default())),
            states: DashMap::new(),
            blacklist: DashMap::new(),
        })
    }

    /// Returns the shared registration-state-machine instance for
    /// `node_id`, creating it on first reference. Shared with whatever
    /// handles `ServerRegistrationRequest`/`ProxyAnnouncement` so the
    /// REGISTERING→REGISTERED edge and this monitor's auto-re-registration
    /// edge operate on the same state.
    pub fn state_for(&self, node_id: &str) -> Arc<StateMachine> {
        Arc::clone(
            self.states
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(StateMachine::new(node_id)))
                .value(),
        )
    }

    fn is_blacklisted(&self, node_id: &str) -> bool {
        match self.blacklist.get(node_id) {
            Some(until) if *until > Utc::now() => true,
            Some(_) => {
                drop(self.blacklist.remove(node_id));
                false
            }
            None => false,
        }
    }

    pub async fn handle_heartbeat(&self, msg: &HeartbeatMessage) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_heartbeats_received();
        }

        let node_id = msg.node_id.as_str();
        if self.is_blacklisted(node_id) {
            if let Some(metrics) = &self.metrics {
                metrics.increment_heartbeats_rejected_blacklisted();
            }
            info!(node_id, "dropped heartbeat from blacklisted node");
            return;
        }

        let known = if is_proxy_id(node_id) { self.proxies.is_known(node_id) } else { self.servers.is_known(node_id) };

        if !known {
            self.handle_unknown_node(node_id).await;
            return;
        }

        let state = self.state_for(node_id);
        match state.current().await {
            RegistrationState::Registered => {
                self.apply_heartbeat_metrics(node_id, msg).await;
            }
            RegistrationState::Registering | RegistrationState::ReRegistering | RegistrationState::Disconnected => {
                state.transition(RegistrationState::Registered, "auto-re-registration via heartbeat").await;
                self.apply_heartbeat_metrics(node_id, msg).await;
            }
            other => {
                if self.warnings.allow(node_id).await {
                    warn!(node_id, state = %other, "heartbeat from known node in unexpected registration state");
                }
            }
        }
    }

    async fn apply_heartbeat_metrics(&self, node_id: &str, msg: &HeartbeatMessage) {
        if is_proxy_id(node_id) {
            self.proxies.record_heartbeat(node_id).await;
        } else {
            self.servers.update_metrics(node_id, msg.player_count, msg.tps).await;
        }
    }

    async fn handle_unknown_node(&self, node_id: &str) {
        if !self.blacklist.contains_key(node_id) {
            if is_proxy_id(node_id) {
                let dead_key = keys::heartbeat_dead_proxy(node_id);
                if kv::get_typed::<RegisteredProxy>(self.kv.as_ref(), &dead_key).await.ok().flatten().is_some() {
                    self.restore_proxy(node_id).await;
                    return;
                }
            } else {
                let dead_key = keys::heartbeat_dead_server(node_id);
                if let Ok(Some(snapshot)) = kv::get_typed::<RegisteredServer>(self.kv.as_ref(), &dead_key).await {
                    self.servers.restore_server(snapshot).await;
                    let _ = self.kv.delete(&dead_key).await;
                    self.state_for(node_id).transition(RegistrationState::Registered, "auto-restore from heartbeat").await;
                    if let Some(metrics) = &self.metrics {
                        metrics.increment_auto_restores();
                    }
                    return;
                }
            }
        }

        let _ = self
            .bus
            .broadcast(
                CH_REGISTRY_REREG_REQUEST,
                BusMessage::RegistryReregRequest(RegistryReregRequest {
                    timestamp: Utc::now(),
                    reason: "heartbeat from unknown node".to_string(),
                    force_reregistration: true,
                    target_id: Some(node_id.to_string()),
                }),
            )
            .await;
    }

    async fn restore_proxy(&self, node_id: &str) {
        self.proxies.reactivate(node_id).await;
        let _ = self.kv.delete(&keys::heartbeat_dead_proxy(node_id)).await;
        self.state_for(node_id).transition(RegistrationState::Registered, "auto-restore from heartbeat").await;
        if let Some(metrics) = &self.metrics {
            metrics.increment_auto_restores();
        }
    }

    /// One pass of the periodic liveness scan (§4.7). Called every
    /// `CHECK_INTERVAL` by [`Self::spawn_scan_task`].
    pub async fn scan_once(&self) {
        let now = Utc::now();

        for proxy in self.proxies.list_active() {
            self.evaluate_node(&proxy.id.canonical(), proxy.last_heartbeat, proxy.registered_at, proxy.status, now)
                .await;
        }
        for server in self.servers.list_active() {
            self.evaluate_node(&server.id.canonical(), server.last_heartbeat, server.registered_at, server.status, now)
                .await;
        }
    }

    async fn evaluate_node(
        &self,
        node_id: &str,
        last_heartbeat: DateTime<Utc>,
        registered_at: DateTime<Utc>,
        current: NodeStatus,
        now: DateTime<Utc>,
    ) {
        if now.signed_duration_since(registered_at).to_std().unwrap_or_default() < GRACE_PERIOD {
            return;
        }

        let delta = now.signed_duration_since(last_heartbeat).to_std().unwrap_or_default();

        if delta >= DEAD_TIMEOUT {
            self.declare_dead(node_id, now).await;
        } else if delta >= UNAVAILABLE_TIMEOUT {
            if current != NodeStatus::Unavailable {
                self.set_status(node_id, NodeStatus::Unavailable);
                self.broadcast_status_change(node_id, NodeStatus::Unavailable, now).await;
                if let Some(metrics) = &self.metrics {
                    metrics.increment_transitions_to_unavailable();
                }
                info!(node_id, "node transitioned to UNAVAILABLE on heartbeat timeout");
            }
        } else if current != NodeStatus::Available {
            self.set_status(node_id, NodeStatus::Available);
            self.broadcast_status_change(node_id, NodeStatus::Available, now).await;
            info!(node_id, "node transitioned to AVAILABLE on heartbeat recovery");
        }
    }

    fn set_status(&self, node_id: &str, status: NodeStatus) {
        if is_proxy_id(node_id) {
            self.proxies.set_status(node_id, status);
        } else {
            self.servers.set_status(node_id, status);
        }
    }

    /// Exactly one broadcast per AVAILABLE↔UNAVAILABLE transition (§4.7);
    /// never called for a no-op re-classification.
    async fn broadcast_status_change(&self, node_id: &str, status: NodeStatus, now: DateTime<Utc>) {
        let _ = self
            .bus
            .broadcast(
                CH_STATUS_CHANGE,
                BusMessage::StatusChange(StatusChangeMessage { node_id: node_id.to_string(), status, timestamp: now }),
            )
            .await;
    }

    async fn declare_dead(&self, node_id: &str, now: DateTime<Utc>) {
        self.blacklist.insert(node_id.to_string(), now + chrono::Duration::from_std(DEAD_BLACKLIST).unwrap());

        if is_proxy_id(node_id) {
            if let Some(proxy) = self.proxies.get(node_id) {
                let _ = kv::put_typed(self.kv.as_ref(), &keys::heartbeat_dead_proxy(node_id), &proxy).await;
            }
            self.proxies.deregister(node_id).await;
        } else {
            if let Some(server) = self.servers.get(node_id) {
                let _ = kv::put_typed(self.kv.as_ref(), &keys::heartbeat_dead_server(node_id), &server).await;
                let _ = self
                    .bus
                    .broadcast(
                        CH_SERVER_REMOVAL,
                        BusMessage::ServerRemoval(ServerRemoval {
                            server_id: node_id.to_string(),
                            server_type: server.server_type.clone(),
                            reason: "heartbeat-dead-timeout".to_string(),
                            timestamp: now,
                        }),
                    )
                    .await;
            }
            self.servers.deregister(node_id).await;
        }

        self.state_for(node_id).transition(RegistrationState::Disconnected, "declared dead by heartbeat monitor").await;
        if let Some(metrics) = &self.metrics {
            metrics.increment_transitions_to_dead();
        }
        warn!(node_id, "node declared DEAD, blacklisted and removed from active registry");
    }

    pub fn spawn_scan_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                this.scan_once().await;
            }
        })
    }
}
