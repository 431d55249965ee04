//! Shutdown / evacuation coordinator (C10). Tracks outstanding
//! `ShutdownIntent`s, issues one-shot tickets for players displaced by an
//! evacuation, and lets the routing coordinator redeem a ticket to honor
//! the intent's `backendTransferHint` (§4.9.1 step 1).

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::kv::{self, keys, Kv};
use crate::metrics::FulcrumMetrics;
use crate::protocol::messages::{ShutdownIntentMessage, ShutdownIntentUpdateMessage, ShutdownPhase};
use crate::protocol::{ShutdownIntent, ShutdownTicket};
use crate::registry::ServerRegistry;

pub struct ShutdownCoordinator {
    intents: DashMap<String, ShutdownIntent>,
    tickets: DashMap<String, ShutdownTicket>,
    servers: Arc<ServerRegistry>,
    kv: Arc<dyn Kv>,
    metrics: Option<Arc<FulcrumMetrics>>,
}

impl ShutdownCoordinator {
    pub fn new(servers: Arc<ServerRegistry>, kv: Arc<dyn Kv>, metrics: Option<Arc<FulcrumMetrics>>) -> Arc<Self> {
        Arc::new(Self { intents: DashMap::new(), tickets: DashMap::new(), servers, kv, metrics })
    }

    pub async fn load_from_kv(&self) {
        if let Ok(entries) = self.kv.scan_prefix("shutdown:intent:").await {
            for (key, value) in entries {
                match serde_json::from_value::<ShutdownIntent>(value) {
                    Ok(intent) => {
                        self.intents.insert(intent.id.clone(), intent);
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted shutdown intent"),
                }
            }
        }
        if let Ok(entries) = self.kv.scan_prefix("shutdown:ticket:").await {
            for (key, value) in entries {
                match serde_json::from_value::<ShutdownTicket>(value) {
                    Ok(ticket) => {
                        self.tickets.insert(ticket.player_id.clone(), ticket);
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted shutdown ticket"),
                }
            }
        }
    }

    /// Begins (or cancels) the evacuation plan described by `msg`,
    /// ticketing every player in `online_player_ids` — sourced by the
    /// caller from the routing coordinator's active-slot tracker, since
    /// this component has no player roster of its own.
    pub async fn begin(&self, msg: ShutdownIntentMessage, online_player_ids: &[String]) {
        if msg.cancelled {
            self.cancel(&msg.id).await;
            return;
        }

        let intent = ShutdownIntent {
            id: msg.id.clone(),
            services: msg.services.clone(),
            countdown_seconds: msg.countdown_seconds,
            backend_transfer_hint: msg.backend_transfer_hint.clone(),
            created_at: Utc::now(),
            cancelled: false,
        };
        self.intents.insert(intent.id.clone(), intent.clone());
        if let Err(err) = kv::put_typed(self.kv.as_ref(), &keys::shutdown_intent(&intent.id), &intent).await {
            warn!(intent_id = %intent.id, error = %err, "failed to persist shutdown intent");
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(msg.countdown_seconds as i64);
        for player_id in online_player_ids {
            let ticket = ShutdownTicket {
                player_id: player_id.clone(),
                intent_id: intent.id.clone(),
                expires_at,
                consumed: false,
            };
            self.tickets.insert(player_id.clone(), ticket.clone());
            let _ = kv::put_typed(self.kv.as_ref(), &keys::shutdown_ticket(player_id, &intent.id), &ticket).await;
            if let Some(metrics) = &self.metrics {
                metrics.increment_shutdown_tickets_issued();
            }
        }

        for service in &intent.services {
            self.servers.set_evacuating(service, true);
        }

        info!(intent_id = %intent.id, services = ?intent.services, tickets = online_player_ids.len(), "shutdown evacuation started");
    }

    pub async fn cancel(&self, intent_id: &str) {
        let Some((_, intent)) = self.intents.remove(intent_id) else {
            return;
        };
        let _ = self.kv.delete(&keys::shutdown_intent(intent_id)).await;

        let ticket_holders: Vec<String> =
            self.tickets.iter().filter(|e| e.intent_id == intent_id).map(|e| e.key().clone()).collect();
        for player_id in ticket_holders {
            self.tickets.remove(&player_id);
            let _ = self.kv.delete(&keys::shutdown_ticket(&player_id, intent_id)).await;
        }

        for service in &intent.services {
            self.servers.set_evacuating(service, false);
        }

        info!(intent_id, "shutdown evacuation cancelled, tickets released");
    }

    /// Redeems the ticket for `player_id` against `intent_id`, returning
    /// the intent's `backendTransferHint` on success. Fails closed: a
    /// missing, mismatched, already-consumed, or expired ticket all
    /// return `None`.
    pub async fn consume_ticket(&self, player_id: &str, intent_id: &str) -> Option<String> {
        let valid = match self.tickets.get(player_id) {
            Some(ticket) => ticket.intent_id == intent_id && !ticket.consumed && Utc::now() <= ticket.expires_at,
            None => false,
        };

        if !valid {
            if let Some(metrics) = &self.metrics {
                metrics.increment_shutdown_tickets_rejected_reuse();
            }
            return None;
        }

        self.tickets.remove(player_id);
        let _ = self.kv.delete(&keys::shutdown_ticket(player_id, intent_id)).await;
        let hint = self.intents.get(intent_id).map(|i| i.backend_transfer_hint.clone());
        if let Some(metrics) = &self.metrics {
            metrics.increment_shutdown_tickets_consumed();
        }
        hint
    }

    /// Passive bookkeeping for a service's self-reported phase advance;
    /// the coordinator does not drive EVACUATE→EVICT→SHUTDOWN itself.
    pub fn handle_update(&self, msg: ShutdownIntentUpdateMessage) {
        info!(intent_id = %msg.intent_id, service_id = %msg.service_id, phase = ?msg.phase, "shutdown phase advanced");
        if msg.phase == ShutdownPhase::Shutdown {
            self.servers.set_evacuating(&msg.service_id, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdAllocator, IdKind};
    use crate::kv::InMemoryKv;
    use std::time::Duration as StdDuration;

    fn coordinator() -> (Arc<ShutdownCoordinator>, Arc<ServerRegistry>) {
        let kv = Arc::new(InMemoryKv::new());
        let servers = ServerRegistry::new(Arc::new(IdAllocator::new(IdKind::Server, StdDuration::from_secs(300))), kv.clone());
        let coordinator = ShutdownCoordinator::new(Arc::clone(&servers), kv, None);
        (coordinator, servers)
    }

    #[tokio::test]
    async fn begin_issues_a_ticket_per_online_player() {
        let (coordinator, servers) = coordinator();
        let server = servers.register("temp-1", "lobby", "lobby", "10.0.0.1", 25565, 100).await;
        coordinator
            .begin(
                ShutdownIntentMessage {
                    id: "intent-1".to_string(),
                    services: vec![server.id.canonical()],
                    countdown_seconds: 30,
                    reason: "maintenance".to_string(),
                    backend_transfer_hint: "lobby".to_string(),
                    force: false,
                    cancelled: false,
                    version: 1,
                },
                &["p1".to_string(), "p2".to_string()],
            )
            .await;

        let hint = coordinator.consume_ticket("p1", "intent-1").await;
        assert_eq!(hint, Some("lobby".to_string()));
        assert!(servers.get(&server.id.canonical()).unwrap().is_evacuating);
    }

    #[tokio::test]
    async fn a_consumed_ticket_cannot_be_reused() {
        let (coordinator, servers) = coordinator();
        let server = servers.register("temp-2", "lobby", "lobby", "10.0.0.2", 25566, 100).await;
        coordinator
            .begin(
                ShutdownIntentMessage {
                    id: "intent-2".to_string(),
                    services: vec![server.id.canonical()],
                    countdown_seconds: 30,
                    reason: "maintenance".to_string(),
                    backend_transfer_hint: "lobby".to_string(),
                    force: false,
                    cancelled: false,
                    version: 1,
                },
                &["p1".to_string()],
            )
            .await;

        assert!(coordinator.consume_ticket("p1", "intent-2").await.is_some());
        assert!(coordinator.consume_ticket("p1", "intent-2").await.is_none());
    }

    #[tokio::test]
    async fn cancelling_an_intent_releases_its_tickets_and_evacuation_flag() {
        let (coordinator, servers) = coordinator();
        let server = servers.register("temp-3", "lobby", "lobby", "10.0.0.3", 25567, 100).await;
        coordinator
            .begin(
                ShutdownIntentMessage {
                    id: "intent-3".to_string(),
                    services: vec![server.id.canonical()],
                    countdown_seconds: 30,
                    reason: "maintenance".to_string(),
                    backend_transfer_hint: "lobby".to_string(),
                    force: false,
                    cancelled: false,
                    version: 1,
                },
                &["p1".to_string()],
            )
            .await;

        coordinator.cancel("intent-3").await;
        assert!(coordinator.consume_ticket("p1", "intent-3").await.is_none());
        assert!(!servers.get(&server.id.canonical()).unwrap().is_evacuating);
    }
}
