//! Top-level orchestration. `FulcrumCore` wires the twelve components
//! together, restores every component's KV mirror before any bus
//! subscription opens (§4.6), then runs one dispatch task per inbound
//! channel — "one inbound dispatcher per channel" (§5) realized literally
//! as one task per subscription, same as [`crate::bus::Bus::subscribe`]'s
//! contract promises.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::{BusEnvelope, SharedBus};
use crate::config::Config;
use crate::distributed::DistributedLock;
use crate::heartbeat::HeartbeatMonitor;
use crate::ids::{IdAllocator, IdKind};
use crate::kv::Kv;
use crate::metrics::FulcrumMetrics;
use crate::network_profile::NetworkProfileStore;
use crate::protocol::messages::{
    CH_HEARTBEAT, CH_MATCH_ROSTER_CREATED, CH_MATCH_ROSTER_ENDED, CH_PARTY_RESERVATION_CLAIMED,
    CH_PARTY_RESERVATION_CREATED, CH_PLAYER_REQUEST, CH_PLAYER_ROUTE_ACK, CH_PROXY_ANNOUNCEMENT,
    CH_REGISTRY_ENVIRONMENT_ROUTE_REQUEST, CH_REGISTRY_NETWORK_CONFIG_REQUEST, CH_REGISTRY_SHUTDOWN_INTENT,
    CH_REGISTRY_SHUTDOWN_UPDATE, CH_SERVER_EVACUATION_REQUEST, CH_SERVER_REGISTRATION_REQUEST,
    CH_SLOT_FAMILY_ADVERTISEMENT, CH_SLOT_STATUS, CH_SOCIAL_FRIEND_MUTATION_REQUEST,
};
use crate::protocol::messages::{
    CH_SERVER_EVACUATION_RESPONSE, CH_SERVER_REGISTRATION_RESPONSE, ServerEvacuationRequest,
    ServerEvacuationResponse, ServerRegistrationRequest, ServerRegistrationResponse, SlotStatusUpdate,
};
use crate::protocol::{BusMessage, RegistrationState, SlotStatus, Validate};
use crate::provisioner::SlotProvisioner;
use crate::registry::{ProxyRegistry, ServerRegistry};
use crate::routing::coordinator::RoutingCoordinator;
use crate::shutdown::ShutdownCoordinator;
use crate::social::SocialRouter;

pub struct FulcrumCore {
    bus: SharedBus,
    metrics: Option<Arc<FulcrumMetrics>>,
    pub proxies: Arc<ProxyRegistry>,
    pub servers: Arc<ServerRegistry>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub provisioner: Arc<SlotProvisioner>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub routing: Arc<RoutingCoordinator>,
    pub network_profile: Arc<NetworkProfileStore>,
    pub social: Arc<SocialRouter>,
}

impl FulcrumCore {
    /// Builds a core with default timing (matching the compiled-in defaults
    /// in [`crate::config::defaults`]). Equivalent to
    /// `Self::with_config(bus, kv, lock, metrics, &Config::default())`.
    pub fn new(
        bus: SharedBus,
        kv: Arc<dyn Kv>,
        lock: Arc<dyn DistributedLock>,
        metrics: Option<Arc<FulcrumMetrics>>,
    ) -> Arc<Self> {
        Self::with_config(bus, kv, lock, metrics, &Config::default())
    }

    pub fn with_config(
        bus: SharedBus,
        kv: Arc<dyn Kv>,
        lock: Arc<dyn DistributedLock>,
        metrics: Option<Arc<FulcrumMetrics>>,
        config: &Config,
    ) -> Arc<Self> {
        let id_release_window = Duration::from_secs(config.ids.release_window_secs);
        let proxies = ProxyRegistry::new(Arc::new(IdAllocator::new(IdKind::Proxy, id_release_window)), Arc::clone(&kv));
        let servers = ServerRegistry::new(Arc::new(IdAllocator::new(IdKind::Server, id_release_window)), Arc::clone(&kv));
        let heartbeat =
            HeartbeatMonitor::new(Arc::clone(&proxies), Arc::clone(&servers), Arc::clone(&kv), Arc::clone(&bus), metrics.clone());
        let provisioner = SlotProvisioner::with_lock_ttl(
            Arc::clone(&servers),
            lock,
            Arc::clone(&bus),
            metrics.clone(),
            Duration::from_secs(config.provisioner.provision_lock_ttl_secs),
        );
        let shutdown = ShutdownCoordinator::new(Arc::clone(&servers), Arc::clone(&kv), metrics.clone());
        let routing = RoutingCoordinator::new(
            Arc::clone(&proxies),
            Arc::clone(&servers),
            Arc::clone(&provisioner),
            Arc::clone(&shutdown),
            Arc::clone(&bus),
            Arc::clone(&kv),
            metrics.clone(),
        );
        let network_profile = NetworkProfileStore::new(Arc::clone(&bus), kv);
        let social = SocialRouter::new(Arc::clone(&bus));

        Arc::new(Self {
            bus,
            metrics,
            proxies,
            servers,
            heartbeat,
            provisioner,
            shutdown,
            routing,
            network_profile,
            social,
        })
    }

    /// Restores every component's persisted state from the KV mirror.
    /// Must complete before [`Self::run`] opens a single bus subscription
    /// (§4.6) — an inbound message handled against an empty registry would
    /// misclassify a node that was active before the restart.
    pub async fn load_from_kv(&self) {
        self.proxies.load_from_kv().await;
        self.servers.load_from_kv().await;
        self.routing.load_from_kv().await;
        self.shutdown.load_from_kv().await;
        self.network_profile.load_from_kv().await;
        info!("fulcrum core restored state from kv mirror");
    }

    /// Spawns the periodic background tasks (heartbeat scan, registry
    /// recycle-window sweeps) and one dispatch task per inbound channel,
    /// then returns immediately — the caller decides how to block.
    pub fn run(self: &Arc<Self>) {
        self.heartbeat.spawn_scan_task();
        self.proxies.spawn_cleanup_task();
        self.servers.spawn_cleanup_task();

        self.spawn_dispatcher(CH_SERVER_REGISTRATION_REQUEST, |this, msg| async move {
            let BusMessage::ServerRegistrationRequest(req) = msg else { return };
            this.handle_server_registration_request(req).await;
        });
        self.spawn_dispatcher(CH_SERVER_EVACUATION_REQUEST, |this, msg| async move {
            let BusMessage::ServerEvacuationRequest(req) = msg else { return };
            this.handle_server_evacuation_request(req).await;
        });
        self.spawn_dispatcher(CH_HEARTBEAT, |this, msg| async move {
            let BusMessage::Heartbeat(hb) = msg else { return };
            if let Err(err) = hb.validate() {
                warn!(error = %err, "dropping malformed heartbeat");
                return;
            }
            this.heartbeat.handle_heartbeat(&hb).await;
        });
        self.spawn_dispatcher(CH_PROXY_ANNOUNCEMENT, |this, msg| async move {
            let BusMessage::ProxyAnnouncement(announcement) = msg else { return };
            this.handle_proxy_announcement(announcement).await;
        });
        self.spawn_dispatcher(CH_SLOT_FAMILY_ADVERTISEMENT, |this, msg| async move {
            let BusMessage::SlotFamilyAdvertisement(ad) = msg else { return };
            this.provisioner.record_advertisement(ad);
        });
        self.spawn_dispatcher(CH_SLOT_STATUS, |this, msg| async move {
            let BusMessage::SlotStatusUpdate(update) = msg else { return };
            if let Err(err) = update.validate() {
                warn!(error = %err, "dropping malformed slot status update");
                return;
            }
            this.routing.handle_slot_status_update(update).await;
        });
        self.spawn_dispatcher(CH_PLAYER_REQUEST, |this, msg| async move {
            let BusMessage::PlayerSlotRequest(req) = msg else { return };
            this.routing.handle_player_request(req).await;
        });
        self.spawn_dispatcher(CH_PLAYER_ROUTE_ACK, |this, msg| async move {
            let BusMessage::PlayerRouteAck(ack) = msg else { return };
            this.routing.handle_route_ack(ack).await;
        });
        self.spawn_dispatcher(CH_REGISTRY_ENVIRONMENT_ROUTE_REQUEST, |this, msg| async move {
            let BusMessage::EnvironmentRouteRequest(req) = msg else { return };
            this.routing.handle_environment_route_request(req).await;
        });
        self.spawn_dispatcher(CH_PARTY_RESERVATION_CREATED, |this, msg| async move {
            let BusMessage::PartyReservationCreated(created) = msg else { return };
            this.routing.handle_party_reservation_created(created).await;
        });
        self.spawn_dispatcher(CH_PARTY_RESERVATION_CLAIMED, |this, msg| async move {
            let BusMessage::PartyReservationClaimed(claimed) = msg else { return };
            this.routing.handle_party_reservation_claimed(claimed).await;
        });
        self.spawn_dispatcher(CH_MATCH_ROSTER_CREATED, |this, msg| async move {
            let BusMessage::MatchRosterCreated(created) = msg else { return };
            this.routing.handle_match_roster_created(created).await;
        });
        self.spawn_dispatcher(CH_MATCH_ROSTER_ENDED, |this, msg| async move {
            let BusMessage::MatchRosterEnded(ended) = msg else { return };
            this.routing.handle_match_roster_ended(ended).await;
        });
        self.spawn_dispatcher(CH_REGISTRY_SHUTDOWN_INTENT, |this, msg| async move {
            let BusMessage::ShutdownIntentMessage(intent) = msg else { return };
            let online = this.routing.online_player_ids();
            this.shutdown.begin(intent, &online).await;
        });
        self.spawn_dispatcher(CH_REGISTRY_SHUTDOWN_UPDATE, |this, msg| async move {
            let BusMessage::ShutdownIntentUpdateMessage(update) = msg else { return };
            this.shutdown.handle_update(update);
        });
        self.spawn_dispatcher(CH_REGISTRY_NETWORK_CONFIG_REQUEST, |this, msg| async move {
            let BusMessage::NetworkConfigRequest(req) = msg else { return };
            this.network_profile.handle_request(req).await;
        });
        self.spawn_dispatcher(CH_SOCIAL_FRIEND_MUTATION_REQUEST, |this, msg| async move {
            let BusMessage::FriendMutationCommand(command) = msg else { return };
            this.social.handle_mutation(command).await;
        });

        info!("fulcrum core subscribed to every inbound channel");
    }

    /// Spawns a task that drains `channel` for as long as the bus keeps the
    /// subscription's sender alive, handing each envelope to `handler`.
    fn spawn_dispatcher<F, Fut>(self: &Arc<Self>, channel: &'static str, handler: F)
    where
        F: Fn(Arc<Self>, BusMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            let (_id, mut rx) = bus.subscribe(channel).await;
            while let Some(BusEnvelope { message, .. }) = rx.recv().await {
                handler(Arc::clone(&this), message).await;
            }
        });
    }

    /// §4.3/§4.4: register the backend, drive its state machine through
    /// REGISTERING→REGISTERED, and answer with the assigned id.
    async fn handle_server_registration_request(self: &Arc<Self>, req: ServerRegistrationRequest) {
        if let Err(err) = req.validate() {
            warn!(error = %err, "dropping malformed server registration request");
            return;
        }

        let server = self
            .servers
            .register(&req.temp_id, &req.server_type, &req.role, &req.address, req.port, req.max_capacity)
            .await;
        let node_id = server.id.canonical();
        let state = self.heartbeat.state_for(&node_id);
        state.transition(RegistrationState::Registering, "server registration request accepted").await;
        state.transition(RegistrationState::Registered, "server registration acknowledged").await;

        if let Some(metrics) = &self.metrics {
            metrics.increment_servers_registered();
        }

        let response = ServerRegistrationResponse {
            temp_id: req.temp_id,
            assigned_server_id: node_id,
            success: true,
            message: "registered".to_string(),
            server_type: req.server_type,
            address: req.address,
            port: req.port,
            proxy_id: None,
        };
        let _ = self.bus.broadcast(CH_SERVER_REGISTRATION_RESPONSE, BusMessage::ServerRegistrationResponse(response)).await;
    }

    /// §4.4: a proxy's self-announcement doubles as its registration
    /// handshake — there is no separate request/response pair for proxies
    /// the way there is for backend servers.
    async fn handle_proxy_announcement(self: &Arc<Self>, announcement: crate::protocol::messages::ProxyAnnouncement) {
        if let Err(err) = announcement.validate() {
            warn!(error = %err, "dropping malformed proxy announcement");
            return;
        }

        let proxy = self.proxies.register(Some(&announcement.proxy_id), &announcement.address, 0).await;
        let node_id = proxy.id.canonical();
        let state = self.heartbeat.state_for(&node_id);
        if state.current().await == RegistrationState::Unregistered {
            state.transition(RegistrationState::Registering, "proxy announcement received").await;
            state.transition(RegistrationState::Registered, "proxy announcement acknowledged").await;
            if let Some(metrics) = &self.metrics {
                metrics.increment_proxies_registered();
            }
        }
    }

    /// Evacuates every slot currently hosted on `server_id`: marks the
    /// server non-routable and forces each of its slots through the same
    /// failure path a FAULTED status report would (§4.9.9), so in-flight
    /// routes retry elsewhere instead of landing on a server about to shut
    /// down.
    async fn handle_server_evacuation_request(self: &Arc<Self>, req: ServerEvacuationRequest) {
        self.servers.set_evacuating(&req.server_id, true);

        let slots = self.servers.get(&req.server_id).map(|s| s.slots).unwrap_or_default();
        let mut players_evacuated = 0u32;
        for (slot_id, slot) in slots {
            players_evacuated += slot.online_players;
            self.routing
                .handle_slot_status_update(SlotStatusUpdate {
                    server_id: req.server_id.clone(),
                    slot_id,
                    status: SlotStatus::Faulted,
                    online_players: slot.online_players,
                    max_players: slot.max_players,
                    metadata: slot.metadata,
                })
                .await;
        }

        let response = ServerEvacuationResponse {
            server_id: req.server_id,
            success: true,
            players_evacuated,
            players_failed: 0,
            message: "evacuation in progress".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let _ = self.bus.broadcast(CH_SERVER_EVACUATION_RESPONSE, BusMessage::ServerEvacuationResponse(response)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::distributed::InMemoryDistributedLock;
    use crate::kv::InMemoryKv;
    use crate::protocol::messages::{player_route_channel, HeartbeatMessage, PlayerRouteCommand};
    use std::collections::HashMap;

    fn core() -> (Arc<FulcrumCore>, SharedBus) {
        let bus: SharedBus = Arc::new(InMemoryBus::new());
        let kv: Arc<dyn Kv> = Arc::new(InMemoryKv::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryDistributedLock::new());
        let core = FulcrumCore::new(Arc::clone(&bus), kv, lock, None);
        (core, bus)
    }

    #[tokio::test]
    async fn server_registration_request_assigns_an_id_and_responds() {
        let (core, bus) = core();
        core.load_from_kv().await;
        core.run();
        let (_id, mut rx) = bus.subscribe(CH_SERVER_REGISTRATION_RESPONSE).await;

        bus.broadcast(
            CH_SERVER_REGISTRATION_REQUEST,
            BusMessage::ServerRegistrationRequest(ServerRegistrationRequest {
                temp_id: "temp-1".to_string(),
                server_type: "lobby".to_string(),
                max_capacity: 100,
                address: "10.0.0.1".to_string(),
                port: 25565,
                role: "lobby".to_string(),
                version: None,
            }),
        )
        .await
        .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let BusMessage::ServerRegistrationResponse(response) = envelope.message else { panic!("expected response") };
        assert!(response.success);
        assert_eq!(response.assigned_server_id, "fulcrum-server-1");
    }

    #[tokio::test]
    async fn a_player_request_with_no_known_proxy_gets_disconnected() {
        let (core, bus) = core();
        core.load_from_kv().await;
        core.run();
        let (_id, mut rx) = bus.subscribe(&player_route_channel("fulcrum-proxy-1")).await;

        bus.broadcast(
            CH_PLAYER_REQUEST,
            BusMessage::PlayerSlotRequest(crate::protocol::messages::PlayerSlotRequestMessage {
                request_id: "r1".to_string(),
                player_id: "p1".to_string(),
                player_name: "p1".to_string(),
                proxy_id: "fulcrum-proxy-1".to_string(),
                family_id: "lobby".to_string(),
                metadata: HashMap::new(),
            }),
        )
        .await
        .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let BusMessage::PlayerRouteCommand(PlayerRouteCommand { reason, .. }) = envelope.message else {
            panic!("expected route command")
        };
        assert_eq!(reason.as_deref(), Some(crate::protocol::disconnect_reason::UNKNOWN_PROXY));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_node_requests_reregistration() {
        let (core, bus) = core();
        core.load_from_kv().await;
        core.run();
        let (_id, mut rx) = bus.subscribe(crate::protocol::messages::CH_REGISTRY_REREG_REQUEST).await;

        bus.broadcast(
            CH_HEARTBEAT,
            BusMessage::Heartbeat(HeartbeatMessage {
                node_id: "fulcrum-server-9".to_string(),
                player_count: 0,
                tps: 20.0,
                timestamp: chrono::Utc::now(),
            }),
        )
        .await
        .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(envelope.message, BusMessage::RegistryReregRequest(_)));
    }
}
