//! Top-level orchestration for the player routing coordinator (C9):
//! incoming-request handling (§4.9.1), dispatch (§4.9.6), acknowledgement
//! (§4.9.7), bounded retry (§4.9.8), slot failure (§4.9.9) and
//! cross-game environment routing (§4.9.10).

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::bus::SharedBus;
use crate::kv::{self, keys, Kv};
use crate::metrics::FulcrumMetrics;
use crate::protocol::messages::{
    default_route_command_version, player_route_channel, server_player_route_channel,
    EnvironmentRouteFailureMode, EnvironmentRouteRequestMessage, MatchRosterCreatedMessage, MatchRosterEndedMessage,
    PartyReservationClaimedMessage, PartyReservationCreatedMessage, PlayerRouteAck, PlayerRouteCommand,
    PlayerSlotRequestMessage, RouteAckStatus, RouteAction, SlotStatusUpdate,
};
use crate::protocol::{
    disconnect_reason, ack_reason, is_retryable_reason, InFlightRoute, LogicalSlot, PlayerRequest,
    PlayerRequestContext, SlotStatus, Validate,
};
use crate::protocol::BusMessage;
use crate::provisioner::SlotProvisioner;
use crate::registry::{ProxyRegistry, ServerRegistry};
use crate::routing::party::PartyCoordinator;
use crate::routing::queue::RouteQueue;
use crate::routing::selection::{self, BlockedSlotContext};
use crate::routing::tracker::PlayerSlotTracker;
use crate::routing::{reservation, MAX_QUEUE_WAIT, MAX_ROUTE_RETRIES, ROUTE_TIMEOUT};
use crate::shutdown::ShutdownCoordinator;

pub struct RoutingCoordinator {
    proxies: Arc<ProxyRegistry>,
    servers: Arc<ServerRegistry>,
    provisioner: Arc<SlotProvisioner>,
    shutdown: Arc<ShutdownCoordinator>,
    bus: SharedBus,
    kv: Arc<dyn Kv>,
    metrics: Option<Arc<FulcrumMetrics>>,
    queue: RouteQueue,
    tracker: PlayerSlotTracker,
    party: PartyCoordinator,
    pending_occupancy: DashMap<String, u32>,
    in_flight: DashMap<String, InFlightRoute>,
    slot_first_seen: DashMap<String, i64>,
}

impl RoutingCoordinator {
    pub fn new(
        proxies: Arc<ProxyRegistry>,
        servers: Arc<ServerRegistry>,
        provisioner: Arc<SlotProvisioner>,
        shutdown: Arc<ShutdownCoordinator>,
        bus: SharedBus,
        kv: Arc<dyn Kv>,
        metrics: Option<Arc<FulcrumMetrics>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxies,
            queue: RouteQueue::new(Arc::clone(&kv)),
            tracker: PlayerSlotTracker::new(Arc::clone(&kv)),
            party: PartyCoordinator::new(Arc::clone(&kv)),
            servers,
            provisioner,
            shutdown,
            bus,
            kv,
            metrics,
            pending_occupancy: DashMap::new(),
            in_flight: DashMap::new(),
            slot_first_seen: DashMap::new(),
        })
    }

    pub async fn load_from_kv(&self) {
        self.queue.load_from_kv().await;
        self.party.load_from_kv().await;
        self.tracker.load_from_kv().await;
        if let Ok(entries) = self.kv.scan_prefix("route:inflight:").await {
            for (key, value) in entries {
                match serde_json::from_value::<InFlightRoute>(value) {
                    Ok(route) => {
                        self.bump_pending(&route.slot_id, 1);
                        self.in_flight.insert(route.request_id.clone(), route);
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted in-flight route"),
                }
            }
        }
    }

    fn pending_for(&self, slot_id: &str) -> u32 {
        self.pending_occupancy.get(slot_id).map(|v| *v).unwrap_or(0)
    }

    fn bump_pending(&self, slot_id: &str, delta: i64) {
        let mut entry = self.pending_occupancy.entry(slot_id.to_string()).or_insert(0);
        *entry = (i64::from(*entry) + delta).max(0) as u32;
    }

    fn first_seen(&self, slot_id: &str) -> i64 {
        *self
            .slot_first_seen
            .entry(slot_id.to_string())
            .or_insert_with(|| Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    fn find_available_slot(&self, family: &str, variant: Option<&str>, blocked: &BlockedSlotContext) -> Option<LogicalSlot> {
        let candidates = self.servers.routable_slots();
        selection::find_available_slot(
            &candidates,
            family,
            variant,
            blocked,
            |slot_id| self.pending_for(slot_id),
            |slot_id| self.first_seen(slot_id),
        )
        .cloned()
    }

    async fn trigger_provision(&self, family: &str) {
        let _ = self.provisioner.request_provision(family, HashMap::new()).await;
    }

    fn build_context(msg: &PlayerSlotRequestMessage, family_id: &str) -> PlayerRequestContext {
        PlayerRequestContext::new(PlayerRequest {
            request_id: msg.request_id.clone(),
            player_id: msg.player_id.clone(),
            player_name: msg.player_name.clone(),
            proxy_id: msg.proxy_id.clone(),
            family_id: family_id.to_string(),
            metadata: msg.metadata.clone(),
        })
    }

    /// §4.9.1: entry point for every inbound `PlayerSlotRequest`.
    pub async fn handle_player_request(self: &Arc<Self>, msg: PlayerSlotRequestMessage) {
        if let Err(err) = msg.validate() {
            warn!(error = %err, "dropping malformed player slot request");
            return;
        }

        let mut family_id = msg.family_id.clone();
        if let Some(intent_id) = msg.metadata.get("shutdownIntentId").and_then(|v| v.as_str()) {
            match self.shutdown.consume_ticket(&msg.player_id, intent_id).await {
                Some(hint) => family_id = hint,
                None => {
                    self.disconnect_msg(&msg, disconnect_reason::SHUTDOWN_TICKET_MISSING).await;
                    return;
                }
            }
        }

        if let Some(reservation_id) = msg.metadata.get("partyReservationId").and_then(|v| v.as_str()).map(str::to_owned) {
            self.handle_party_routed_request(msg, &reservation_id).await;
            return;
        }

        if !self.proxies.is_known(&msg.proxy_id) {
            self.disconnect_msg(&msg, disconnect_reason::UNKNOWN_PROXY).await;
            return;
        }

        let variant = msg.metadata.get("variant").and_then(|v| v.as_str()).map(str::to_owned);
        let context = Self::build_context(&msg, &family_id);
        let mut blocked_slot_ids = self.tracker.blocked_slot_ids(&msg.player_id);
        blocked_slot_ids.extend(context.metadata_blocked_slots().cloned());
        let blocked = BlockedSlotContext { blocked_slot_ids };

        if let Some(rejoin_slot_id) = context.preferred_slot_id.clone() {
            match self.find_rejoin_slot(&rejoin_slot_id, &family_id) {
                Some(slot) => self.route(context, slot).await,
                None => {
                    self.ack_failed(&msg.request_id, &msg.player_id, &msg.proxy_id, ack_reason::REJOIN_SLOT_UNAVAILABLE)
                        .await;
                }
            }
            return;
        }

        match self.find_available_slot(&family_id, variant.as_deref(), &blocked) {
            Some(slot) => self.route(context, slot).await,
            None => {
                self.queue.enqueue(&family_id, context).await;
                self.trigger_provision(&family_id).await;
            }
        }
    }

    fn find_rejoin_slot(&self, slot_id: &str, family_id: &str) -> Option<LogicalSlot> {
        let slot = self.servers.find_slot(slot_id)?;
        if slot.status != SlotStatus::Allocated {
            return None;
        }
        if slot.family() != Some(family_id) {
            return None;
        }
        if slot.remaining_capacity(self.pending_for(slot_id)) <= 0 {
            return None;
        }
        Some(slot)
    }

    async fn handle_party_routed_request(self: &Arc<Self>, msg: PlayerSlotRequestMessage, reservation_id: &str) {
        let Some(reservation) = self.party.get(reservation_id) else {
            self.disconnect_msg(&msg, disconnect_reason::PARTY_RESERVATION_EXPIRED).await;
            return;
        };

        if matches!(reservation.state, crate::protocol::PartyReservationState::Expired) {
            self.disconnect_msg(&msg, disconnect_reason::PARTY_RESERVATION_EXPIRED).await;
            return;
        }

        let (Some(server_id), Some(slot_id)) = (reservation.target_server_id, reservation.target_slot_id.clone())
        else {
            let context = Self::build_context(&msg, &reservation.family_id);
            self.queue.enqueue(&reservation.family_id, context).await;
            return;
        };

        let Some(slot) = self.servers.slot(&server_id.canonical(), &slot_id) else {
            self.disconnect_msg(&msg, disconnect_reason::SLOT_UNAVAILABLE).await;
            return;
        };

        let context = Self::build_context(&msg, &reservation.family_id);
        let team_index =
            reservation.players.iter().position(|p| p == &msg.player_id).unwrap_or(0).to_string();
        let token = reservation.reservation_token.clone().unwrap_or_default();

        self.bump_pending(&slot.slot_id, 1);
        self.dispatch(context, slot, token, Some((team_index, reservation.party_id.clone()))).await;
        self.party.claim(reservation_id, &msg.player_id).await;
    }

    /// §4.9.4: reserve, then dispatch on success or retry/disconnect on
    /// failure.
    async fn route(self: &Arc<Self>, context: PlayerRequestContext, slot: LogicalSlot) {
        if !self.party.is_player_allowed(&slot.slot_id, &context.request.player_id) {
            self.send_disconnect(&context, disconnect_reason::MATCH_ROSTER_LOCKED).await;
            return;
        }

        self.bump_pending(&slot.slot_id, 1);
        let server_id = slot.server_id.canonical();
        let outcome = reservation::request_reservation(
            &self.bus,
            &context.request.player_id,
            &context.request.player_name,
            &context.request.proxy_id,
            &server_id,
            &slot.slot_id,
        )
        .await;

        match outcome {
            reservation::ReservationOutcome::Accepted { token } => {
                self.dispatch(context, slot, token, None).await;
            }
            reservation::ReservationOutcome::Retry { reason } => {
                self.bump_pending(&slot.slot_id, -1);
                self.retry_or_disconnect(context, reason).await;
            }
        }
    }

    /// §4.9.6 dispatch, with the exact slot/request/party metadata
    /// precedence.
    async fn dispatch(
        self: &Arc<Self>,
        context: PlayerRequestContext,
        slot: LogicalSlot,
        reservation_token: String,
        party_fields: Option<(String, String)>,
    ) {
        let mut metadata = slot.metadata.clone();
        for (key, value) in &context.request.metadata {
            metadata.insert(key.clone(), value.clone());
        }
        metadata.insert("reservationToken".to_string(), serde_json::json!(reservation_token));
        metadata.insert("family".to_string(), serde_json::json!(context.request.family_id));
        if let Some((team_index, party_id)) = party_fields {
            metadata.insert("team.index".to_string(), serde_json::json!(team_index));
            metadata.insert("partyId".to_string(), serde_json::json!(party_id));
        }

        let spawn_coord = |key: &str, default: f64| metadata.get(key).and_then(|v| v.as_f64()).unwrap_or(default);
        let command = PlayerRouteCommand {
            action: RouteAction::Route,
            request_id: context.request.request_id.clone(),
            player_id: context.request.player_id.clone(),
            player_name: context.request.player_name.clone(),
            proxy_id: context.request.proxy_id.clone(),
            server_id: Some(slot.server_id.canonical()),
            slot_id: Some(slot.slot_id.clone()),
            slot_suffix: Some(slot.slot_suffix.clone()),
            target_world: metadata.get("targetWorld").and_then(|v| v.as_str()).map(str::to_owned),
            spawn_x: spawn_coord("spawnX", 0.0),
            spawn_y: spawn_coord("spawnY", 64.0),
            spawn_z: spawn_coord("spawnZ", 0.0),
            spawn_yaw: spawn_coord("spawnYaw", 0.0),
            spawn_pitch: spawn_coord("spawnPitch", 0.0),
            metadata,
            reason: None,
            version: default_route_command_version(),
        };

        let route = InFlightRoute {
            request_id: context.request.request_id.clone(),
            slot_id: slot.slot_id.clone(),
            server_id: slot.server_id,
            context: context.clone(),
            dispatched_at: Utc::now(),
        };
        self.in_flight.insert(route.request_id.clone(), route.clone());
        let _ = kv::put_typed(self.kv.as_ref(), &keys::route_inflight(&route.request_id), &route).await;

        let proxy_channel = player_route_channel(&context.request.proxy_id);
        let server_channel = server_player_route_channel(&slot.server_id.canonical());
        let _ = self.bus.broadcast(&proxy_channel, BusMessage::PlayerRouteCommand(command.clone())).await;
        let _ = self.bus.broadcast(&server_channel, BusMessage::PlayerRouteCommand(command)).await;

        if let Some(metrics) = &self.metrics {
            metrics.increment_routes_dispatched();
        }
        self.spawn_route_timeout(route.request_id);
    }

    fn spawn_route_timeout(self: &Arc<Self>, request_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ROUTE_TIMEOUT).await;
            this.handle_route_timeout(&request_id).await;
        });
    }

    async fn handle_route_timeout(self: &Arc<Self>, request_id: &str) {
        let Some((_, route)) = self.in_flight.remove(request_id) else {
            return;
        };
        self.bump_pending(&route.slot_id, -1);
        let _ = self.kv.delete(&keys::route_inflight(request_id)).await;
        warn!(request_id, "route timed out waiting for acknowledgement");
        self.send_disconnect(&route.context, disconnect_reason::ROUTE_TIMEOUT).await;
    }

    /// §4.9.7
    pub async fn handle_route_ack(self: &Arc<Self>, ack: PlayerRouteAck) {
        let Some((_, route)) = self.in_flight.remove(&ack.request_id) else {
            return;
        };
        let _ = self.kv.delete(&keys::route_inflight(&ack.request_id)).await;
        self.bump_pending(&route.slot_id, -1);

        match ack.status {
            RouteAckStatus::Success => {
                self.tracker.record_assignment(&route.context.request.player_id, &route.slot_id).await;
                if let Some(metrics) = &self.metrics {
                    metrics.increment_routes_acked_success();
                }
            }
            RouteAckStatus::Failed => {
                if let Some(metrics) = &self.metrics {
                    metrics.increment_routes_acked_failed();
                }
                let reason = ack.reason.unwrap_or_else(|| disconnect_reason::ROUTE_TIMEOUT.to_string());
                if is_retryable_reason(&reason) {
                    self.retry_or_disconnect(route.context, reason).await;
                } else {
                    self.send_disconnect(&route.context, &reason).await;
                }
            }
        }
    }

    /// §4.9.8: bounded by `MAX_ROUTE_RETRIES` and `MAX_QUEUE_WAIT`.
    async fn retry_or_disconnect(self: &Arc<Self>, mut context: PlayerRequestContext, reason: String) {
        let waited = Utc::now().signed_duration_since(context.created_at).to_std().unwrap_or_default();
        if context.retries >= MAX_ROUTE_RETRIES || waited >= MAX_QUEUE_WAIT {
            self.send_disconnect(&context, &reason).await;
            return;
        }

        context.retries += 1;
        if let Some(metrics) = &self.metrics {
            metrics.increment_routes_retried();
        }
        let family = context.request.family_id.clone();
        self.queue.enqueue(&family, context).await;
        self.trigger_provision(&family).await;
    }

    /// §4.9.3: drain a family's queue up to each eligible slot's capacity.
    pub async fn handle_slot_status_update(self: &Arc<Self>, update: SlotStatusUpdate) {
        let Some(slot) = self.servers.update_slot(&update).await else {
            return;
        };

        match slot.status {
            SlotStatus::Available => {
                if let Some(family) = slot.family().map(str::to_owned) {
                    self.provisioner.release_provision_lock(&family).await;
                    self.drain_family_queue(&family).await;
                }
            }
            SlotStatus::Faulted | SlotStatus::Provisioning | SlotStatus::Cooldown => {
                self.handle_slot_failure(&slot).await;
            }
            SlotStatus::Allocated => {}
        }
    }

    async fn drain_family_queue(self: &Arc<Self>, family: &str) {
        let now = Utc::now();
        for context in self.queue.take_timed_out(family, now, MAX_QUEUE_WAIT) {
            self.send_disconnect(&context, disconnect_reason::QUEUE_TIMEOUT).await;
        }

        let pending = self.queue.drain_all(family);
        let mut deferred = Vec::new();
        let mut routed_any = false;
        for context in pending {
            let mut blocked_slot_ids = self.tracker.blocked_slot_ids(&context.request.player_id);
            blocked_slot_ids.extend(context.metadata_blocked_slots().cloned());
            let blocked = BlockedSlotContext { blocked_slot_ids };
            match self.find_available_slot(family, context.variant_id.as_deref(), &blocked) {
                Some(slot) => {
                    routed_any = true;
                    self.route(context, slot).await;
                }
                None => deferred.push(context),
            }
        }

        let had_deferred = !deferred.is_empty();
        for context in deferred {
            self.queue.enqueue(family, context).await;
        }
        if !routed_any && had_deferred {
            self.trigger_provision(family).await;
        }
    }

    /// Every player currently holding an active slot, sourced by the
    /// shutdown coordinator (C10) to ticket online players for an
    /// evacuation — this component has no player roster of its own.
    pub fn online_player_ids(&self) -> Vec<String> {
        self.tracker.all_active_player_ids()
    }

    pub async fn handle_party_reservation_created(&self, msg: PartyReservationCreatedMessage) {
        self.party.record_reservation(msg).await;
    }

    pub async fn handle_party_reservation_claimed(&self, msg: PartyReservationClaimedMessage) {
        self.party.claim(&msg.reservation_id, &msg.player_id).await;
    }

    pub async fn handle_match_roster_created(&self, msg: MatchRosterCreatedMessage) {
        self.party.record_roster(msg).await;
    }

    pub async fn handle_match_roster_ended(&self, msg: MatchRosterEndedMessage) {
        self.party.end_roster(msg).await;
    }

    /// §4.9.9
    async fn handle_slot_failure(self: &Arc<Self>, slot: &LogicalSlot) {
        let affected: Vec<String> =
            self.in_flight.iter().filter(|e| e.value().slot_id == slot.slot_id).map(|e| e.key().clone()).collect();
        for request_id in affected {
            if let Some((_, route)) = self.in_flight.remove(&request_id) {
                let _ = self.kv.delete(&keys::route_inflight(&request_id)).await;
                self.retry_or_disconnect(route.context, disconnect_reason::SLOT_UNAVAILABLE.to_string()).await;
            }
        }
        self.pending_occupancy.remove(&slot.slot_id);

        if let Some(roster) = self.party.roster_for_slot(&slot.slot_id) {
            self.party
                .end_roster(MatchRosterEndedMessage { match_id: roster.match_id, slot_id: slot.slot_id.clone(), ended_at: Utc::now() })
                .await;
        }
    }

    /// §4.9.10
    pub async fn handle_environment_route_request(&self, msg: EnvironmentRouteRequestMessage) {
        let candidate = self
            .servers
            .list_active()
            .into_iter()
            .filter(|s| s.role == msg.target_environment_id)
            .min_by(|a, b| fill_ratio(a).partial_cmp(&fill_ratio(b)).unwrap_or(std::cmp::Ordering::Equal));

        let Some(server) = candidate else {
            self.handle_environment_failure(&msg).await;
            return;
        };

        let mut metadata = msg.metadata.clone();
        metadata.insert("routeType".to_string(), serde_json::json!("environment"));
        let command = PlayerRouteCommand {
            action: RouteAction::Route,
            request_id: msg.request_id.clone(),
            player_id: msg.player_id.clone(),
            player_name: msg.player_name.clone(),
            proxy_id: msg.proxy_id.clone(),
            server_id: Some(server.id.canonical()),
            slot_id: None,
            slot_suffix: None,
            target_world: msg.world_name.clone(),
            spawn_x: msg.spawn_x,
            spawn_y: msg.spawn_y,
            spawn_z: msg.spawn_z,
            spawn_yaw: 0.0,
            spawn_pitch: 0.0,
            metadata,
            reason: None,
            version: default_route_command_version(),
        };
        let channel = player_route_channel(&msg.proxy_id);
        let _ = self.bus.broadcast(&channel, BusMessage::PlayerRouteCommand(command)).await;
    }

    async fn handle_environment_failure(&self, msg: &EnvironmentRouteRequestMessage) {
        match msg.failure_mode {
            EnvironmentRouteFailureMode::KickOnFail => {
                let command = PlayerRouteCommand {
                    action: RouteAction::Disconnect,
                    request_id: msg.request_id.clone(),
                    player_id: msg.player_id.clone(),
                    player_name: msg.player_name.clone(),
                    proxy_id: msg.proxy_id.clone(),
                    server_id: None,
                    slot_id: None,
                    slot_suffix: None,
                    target_world: None,
                    spawn_x: 0.0,
                    spawn_y: 0.0,
                    spawn_z: 0.0,
                    spawn_yaw: 0.0,
                    spawn_pitch: 0.0,
                    metadata: HashMap::new(),
                    reason: Some("environment-unavailable".to_string()),
                    version: default_route_command_version(),
                };
                let channel = player_route_channel(&msg.proxy_id);
                let _ = self.bus.broadcast(&channel, BusMessage::PlayerRouteCommand(command)).await;
            }
            EnvironmentRouteFailureMode::ReportOnly => {
                warn!(
                    request_id = %msg.request_id,
                    target = %msg.target_environment_id,
                    "environment route failed, no candidate server (report-only)"
                );
            }
        }
    }

    async fn ack_failed(&self, request_id: &str, player_id: &str, proxy_id: &str, reason: &str) {
        let ack = PlayerRouteAck {
            request_id: request_id.to_string(),
            player_id: player_id.to_string(),
            proxy_id: proxy_id.to_string(),
            status: RouteAckStatus::Failed,
            reason: Some(reason.to_string()),
            slot_id: None,
        };
        let channel = player_route_channel(proxy_id);
        let _ = self.bus.broadcast(&channel, BusMessage::PlayerRouteAck(ack)).await;
    }

    async fn disconnect_msg(&self, msg: &PlayerSlotRequestMessage, reason: &str) {
        let context = Self::build_context(msg, &msg.family_id);
        self.send_disconnect(&context, reason).await;
    }

    async fn send_disconnect(&self, context: &PlayerRequestContext, reason: &str) {
        let command = PlayerRouteCommand {
            action: RouteAction::Disconnect,
            request_id: context.request.request_id.clone(),
            player_id: context.request.player_id.clone(),
            player_name: context.request.player_name.clone(),
            proxy_id: context.request.proxy_id.clone(),
            server_id: None,
            slot_id: None,
            slot_suffix: None,
            target_world: None,
            spawn_x: 0.0,
            spawn_y: 0.0,
            spawn_z: 0.0,
            spawn_yaw: 0.0,
            spawn_pitch: 0.0,
            metadata: HashMap::new(),
            reason: Some(reason.to_string()),
            version: default_route_command_version(),
        };
        let channel = player_route_channel(&context.request.proxy_id);
        if let Err(err) = self.bus.broadcast(&channel, BusMessage::PlayerRouteCommand(command)).await {
            warn!(request_id = %context.request.request_id, error = %err, "failed to broadcast disconnect command");
        }
        if let Some(metrics) = &self.metrics {
            metrics.increment_routes_disconnected();
        }
        self.tracker.clear_active(&context.request.player_id);
    }
}

fn fill_ratio(server: &crate::protocol::RegisteredServer) -> f64 {
    if server.max_capacity == 0 {
        0.0
    } else {
        f64::from(server.player_count) / f64::from(server.max_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::distributed::InMemoryDistributedLock;
    use crate::ids::{IdAllocator, IdKind};
    use crate::kv::InMemoryKv;
    use crate::protocol::messages::{CH_PLAYER_RESERVATION_REQUEST, CH_PLAYER_RESERVATION_RESPONSE};
    use crate::protocol::messages::PlayerReservationResponse;
    use std::time::Duration as StdDuration;

    fn coordinator() -> (Arc<RoutingCoordinator>, Arc<ProxyRegistry>, Arc<ServerRegistry>, SharedBus) {
        let kv: Arc<dyn Kv> = Arc::new(InMemoryKv::new());
        let proxies = ProxyRegistry::new(Arc::new(IdAllocator::new(IdKind::Proxy, StdDuration::from_secs(300))), Arc::clone(&kv));
        let servers = ServerRegistry::new(Arc::new(IdAllocator::new(IdKind::Server, StdDuration::from_secs(300))), Arc::clone(&kv));
        let bus: SharedBus = Arc::new(InMemoryBus::new());
        let lock = Arc::new(InMemoryDistributedLock::new());
        let provisioner = SlotProvisioner::new(Arc::clone(&servers), lock, Arc::clone(&bus), None);
        let shutdown = ShutdownCoordinator::new(Arc::clone(&servers), Arc::clone(&kv), None);
        let coordinator = RoutingCoordinator::new(
            Arc::clone(&proxies),
            Arc::clone(&servers),
            provisioner,
            shutdown,
            Arc::clone(&bus),
            kv,
            None,
        );
        (coordinator, proxies, servers, bus)
    }

    fn request(player_id: &str, proxy_id: &str, family: &str) -> PlayerSlotRequestMessage {
        PlayerSlotRequestMessage {
            request_id: uuid::Uuid::new_v4().to_string(),
            player_id: player_id.to_string(),
            player_name: player_id.to_string(),
            proxy_id: proxy_id.to_string(),
            family_id: family.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn request_from_unknown_proxy_is_disconnected() {
        let (coordinator, _proxies, _servers, bus) = coordinator();
        let (_id, mut rx) = bus.subscribe(&player_route_channel("fulcrum-proxy-1")).await;

        coordinator.handle_player_request(request("p1", "fulcrum-proxy-1", "lobby")).await;

        let envelope = rx.try_recv().unwrap();
        let BusMessage::PlayerRouteCommand(command) = envelope.message else { panic!("wrong message") };
        assert_eq!(command.action, RouteAction::Disconnect);
        assert_eq!(command.reason.as_deref(), Some(disconnect_reason::UNKNOWN_PROXY));
    }

    #[tokio::test]
    async fn request_with_no_matching_slot_is_queued_and_triggers_provision() {
        let (coordinator, proxies, _servers, _bus) = coordinator();
        proxies.register(None, "10.0.0.1", 25565).await;

        coordinator.handle_player_request(request("p1", "fulcrum-proxy-1", "lobby")).await;
        assert_eq!(coordinator.queue.len("lobby"), 1);
    }

    #[tokio::test]
    async fn happy_path_reserves_and_dispatches_to_an_available_slot() {
        let (coordinator, proxies, servers, bus) = coordinator();
        proxies.register(None, "10.0.0.1", 25565).await;
        let server = servers.register("temp-1", "lobby", "lobby", "10.0.0.2", 25566, 100).await;
        servers
            .update_slot(&SlotStatusUpdate {
                server_id: server.id.canonical(),
                slot_id: "lobby:1".to_string(),
                status: SlotStatus::Available,
                online_players: 0,
                max_players: 20,
                metadata: HashMap::from([("family".to_string(), serde_json::json!("lobby"))]),
            })
            .await;

        let (_id, mut reservation_rx) = bus.subscribe(&server_player_route_channel(&server.id.canonical())).await;
        let bus_clone = Arc::clone(&bus);
        let responder = tokio::spawn(async move {
            let envelope = reservation_rx.recv().await.unwrap();
            let BusMessage::PlayerReservationRequest(req) = envelope.message else { panic!("expected reservation request") };
            bus_clone
                .broadcast(
                    CH_PLAYER_RESERVATION_RESPONSE,
                    BusMessage::PlayerReservationResponse(PlayerReservationResponse {
                        request_id: req.request_id,
                        server_id: req.server_id,
                        accepted: true,
                        reservation_token: Some("tok".to_string()),
                        reason: None,
                    }),
                )
                .await
                .unwrap();
        });

        let (_id2, mut route_rx) = bus.subscribe(&player_route_channel("fulcrum-proxy-1")).await;
        coordinator.handle_player_request(request("p1", "fulcrum-proxy-1", "lobby")).await;
        responder.await.unwrap();

        let envelope = tokio::time::timeout(StdDuration::from_secs(1), route_rx.recv()).await.unwrap().unwrap();
        let BusMessage::PlayerRouteCommand(command) = envelope.message else { panic!("expected route command") };
        assert_eq!(command.action, RouteAction::Route);
        assert_eq!(command.slot_id.as_deref(), Some("lobby:1"));
        let _ = CH_PLAYER_RESERVATION_REQUEST;
    }

    #[tokio::test]
    async fn metadata_current_slot_id_blocks_the_only_available_slot_into_a_queue() {
        let (coordinator, proxies, servers, _bus) = coordinator();
        proxies.register(None, "10.0.0.1", 25565).await;
        let server = servers.register("temp-2", "lobby", "lobby", "10.0.0.3", 25567, 100).await;
        servers
            .update_slot(&SlotStatusUpdate {
                server_id: server.id.canonical(),
                slot_id: "lobby:1".to_string(),
                status: SlotStatus::Available,
                online_players: 0,
                max_players: 20,
                metadata: HashMap::from([("family".to_string(), serde_json::json!("lobby"))]),
            })
            .await;

        let mut msg = request("p1", "fulcrum-proxy-1", "lobby");
        msg.metadata.insert("currentSlotId".to_string(), serde_json::json!("lobby:1"));
        coordinator.handle_player_request(msg).await;

        assert_eq!(coordinator.queue.len("lobby"), 1, "the only matching slot is blocked, so the request must queue instead of routing back to it");
    }
}
