//! End-to-end acceptance scenarios driven entirely through the bus, the
//! way a proxy or backend server would see the control plane: nothing
//! here reaches into a component directly, every assertion is made on
//! messages received off the bus or records read back from the KV store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fulcrum_core::bus::{Bus, InMemoryBus, SharedBus};
use fulcrum_core::core::FulcrumCore;
use fulcrum_core::distributed::InMemoryDistributedLock;
use fulcrum_core::kv::{self, keys, InMemoryKv, Kv};
use fulcrum_core::metrics::FulcrumMetrics;
use fulcrum_core::protocol::disconnect_reason;
use fulcrum_core::protocol::messages::{
    player_route_channel, server_player_route_channel, BusMessage, PlayerReservationResponse,
    PlayerRouteAck, PlayerSlotRequestMessage, ProxyAnnouncement, RouteAckStatus, RouteAction,
    ServerRegistrationRequest, ShutdownIntentMessage, SlotStatusUpdate, CH_PLAYER_REQUEST,
    CH_PLAYER_RESERVATION_RESPONSE, CH_PLAYER_ROUTE_ACK, CH_PROXY_ANNOUNCEMENT,
    CH_REGISTRY_SHUTDOWN_INTENT, CH_SERVER_REGISTRATION_REQUEST, CH_SERVER_REGISTRATION_RESPONSE,
    CH_SLOT_STATUS,
};
use fulcrum_core::protocol::types::SlotStatus;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn recv<T>(rx: &mut tokio::sync::mpsc::Receiver<fulcrum_core::bus::BusEnvelope>, extract: impl Fn(BusMessage) -> Option<T>) -> T {
    loop {
        let envelope = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        if let Some(value) = extract(envelope.message) {
            return value;
        }
    }
}

fn harness() -> (Arc<FulcrumCore>, SharedBus, Arc<InMemoryKv>) {
    let bus: SharedBus = Arc::new(InMemoryBus::new());
    let kv = Arc::new(InMemoryKv::new());
    let lock = Arc::new(InMemoryDistributedLock::new());
    let metrics = Some(Arc::new(FulcrumMetrics::new()));
    let core = FulcrumCore::new(Arc::clone(&bus), Arc::clone(&kv) as Arc<dyn Kv>, lock, metrics);
    (core, bus, kv)
}

/// Registers a backend server and returns its assigned canonical id.
async fn register_server(bus: &SharedBus, temp_id: &str) -> String {
    let (_id, mut rx) = bus.subscribe(CH_SERVER_REGISTRATION_RESPONSE).await;
    bus.broadcast(
        CH_SERVER_REGISTRATION_REQUEST,
        BusMessage::ServerRegistrationRequest(ServerRegistrationRequest {
            temp_id: temp_id.to_string(),
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
    recv(&mut rx, |m| match m {
        BusMessage::ServerRegistrationResponse(r) if r.temp_id == temp_id => Some(r.assigned_server_id),
        _ => None,
    })
    .await
}

/// Announces a proxy and returns its canonical id (proxies self-assign
/// their id in the announcement; registration is implicit).
async fn announce_proxy(bus: &SharedBus, proxy_id: &str) {
    bus.broadcast(
        CH_PROXY_ANNOUNCEMENT,
        BusMessage::ProxyAnnouncement(ProxyAnnouncement {
            proxy_id: proxy_id.to_string(),
            proxy_index: 0,
            hard_cap: 500,
            soft_cap: 450,
            current_player_count: 0,
            address: "10.0.1.1".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
    .await
    .unwrap();
}

async fn advertise_slot(bus: &SharedBus, server_id: &str, slot_id: &str, family: &str, max_players: u32) {
    let mut metadata = HashMap::new();
    metadata.insert("family".to_string(), serde_json::json!(family));
    bus.broadcast(
        CH_SLOT_STATUS,
        BusMessage::SlotStatusUpdate(SlotStatusUpdate {
            server_id: server_id.to_string(),
            slot_id: slot_id.to_string(),
            status: SlotStatus::Available,
            online_players: 0,
            max_players,
            metadata,
        }),
    )
    .await
    .unwrap();
}

/// Answers exactly one `PlayerReservationRequest` addressed to `server_id`
/// with an acceptance, mimicking what the backend server would do.
fn spawn_reservation_acceptor(bus: SharedBus, server_id: String, token: String) {
    tokio::spawn(async move {
        let (_id, mut rx) = bus.subscribe(&server_player_route_channel(&server_id)).await;
        let envelope = rx.recv().await.expect("reservation request never arrived");
        let BusMessage::PlayerReservationRequest(req) = envelope.message else {
            panic!("expected a reservation request on the server's route channel");
        };
        bus.broadcast(
            CH_PLAYER_RESERVATION_RESPONSE,
            BusMessage::PlayerReservationResponse(PlayerReservationResponse {
                request_id: req.request_id,
                server_id: req.server_id,
                accepted: true,
                reservation_token: Some(token),
                reason: None,
            }),
        )
        .await
        .unwrap();
    });
}

/// S1: a player with a known proxy requests a family that already has an
/// available slot; the coordinator reserves it, dispatches a route, and
/// records the assignment once the proxy acknowledges success.
#[tokio::test]
async fn s1_happy_path_route_to_an_available_slot() {
    let (core, bus, kv) = harness();
    core.load_from_kv().await;
    core.run();

    let server_id = register_server(&bus, "temp-s1").await;
    announce_proxy(&bus, "fulcrum-proxy-1").await;
    advertise_slot(&bus, &server_id, "lobby:1:main", "lobby", 20).await;
    spawn_reservation_acceptor(bus.clone(), server_id.clone(), "tok-s1".to_string());

    let (_id, mut proxy_rx) = bus.subscribe(&player_route_channel("fulcrum-proxy-1")).await;

    bus.broadcast(
        CH_PLAYER_REQUEST,
        BusMessage::PlayerSlotRequest(PlayerSlotRequestMessage {
            request_id: "req-s1".to_string(),
            player_id: "player-1".to_string(),
            player_name: "Player1".to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            family_id: "lobby".to_string(),
            metadata: HashMap::new(),
        }),
    )
    .await
    .unwrap();

    let command = recv(&mut proxy_rx, |m| match m {
        BusMessage::PlayerRouteCommand(c) if c.request_id == "req-s1" => Some(c),
        _ => None,
    })
    .await;
    assert_eq!(command.action, RouteAction::Route);
    assert_eq!(command.server_id.as_deref(), Some(server_id.as_str()));
    assert_eq!(command.slot_id.as_deref(), Some("lobby:1:main"));
    assert_eq!(command.metadata.get("reservationToken").and_then(|v| v.as_str()), Some("tok-s1"));

    bus.broadcast(
        CH_PLAYER_ROUTE_ACK,
        BusMessage::PlayerRouteAck(PlayerRouteAck {
            request_id: "req-s1".to_string(),
            player_id: "player-1".to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            status: RouteAckStatus::Success,
            reason: None,
            slot_id: Some("lobby:1:main".to_string()),
        }),
    )
    .await
    .unwrap();

    // handle_route_ack persists the assignment inline, but the bus dispatch
    // itself is fire-and-forget; give the dispatcher a moment to run before
    // reading KV back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = kv.get(&keys::route_active_player("player-1")).await.unwrap();
    assert_eq!(stored, Some(serde_json::json!("lobby:1:main")));
}

/// S6: an evacuation intent tickets every online player for the target
/// server. A routed player using that ticket gets redirected to the
/// intent's transfer hint; trying to reuse the same ticket afterward is
/// rejected and the player is disconnected instead of routed again.
#[tokio::test]
async fn s6_shutdown_ticket_is_honored_once_then_rejected_on_reuse() {
    let (core, bus, kv) = harness();
    core.load_from_kv().await;
    core.run();

    let server_id = register_server(&bus, "temp-s6").await;
    announce_proxy(&bus, "fulcrum-proxy-1").await;
    advertise_slot(&bus, &server_id, "lobby:1:main", "lobby", 20).await;
    spawn_reservation_acceptor(bus.clone(), server_id.clone(), "tok-s6-a".to_string());

    let (_id, mut proxy_rx) = bus.subscribe(&player_route_channel("fulcrum-proxy-1")).await;

    // Get the player online first, so the shutdown coordinator's roster
    // (sourced from the routing coordinator's tracker) has someone to ticket.
    bus.broadcast(
        CH_PLAYER_REQUEST,
        BusMessage::PlayerSlotRequest(PlayerSlotRequestMessage {
            request_id: "req-s6-a".to_string(),
            player_id: "player-6".to_string(),
            player_name: "Player6".to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            family_id: "lobby".to_string(),
            metadata: HashMap::new(),
        }),
    )
    .await
    .unwrap();
    recv(&mut proxy_rx, |m| match m {
        BusMessage::PlayerRouteCommand(c) if c.request_id == "req-s6-a" => Some(()),
        _ => None,
    })
    .await;
    bus.broadcast(
        CH_PLAYER_ROUTE_ACK,
        BusMessage::PlayerRouteAck(PlayerRouteAck {
            request_id: "req-s6-a".to_string(),
            player_id: "player-6".to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            status: RouteAckStatus::Success,
            reason: None,
            slot_id: Some("lobby:1:main".to_string()),
        }),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(kv.get(&keys::route_active_player("player-6")).await.unwrap().is_some());

    bus.broadcast(
        CH_REGISTRY_SHUTDOWN_INTENT,
        BusMessage::ShutdownIntentMessage(ShutdownIntentMessage {
            id: "intent-s6".to_string(),
            services: vec![server_id.clone()],
            countdown_seconds: 30,
            reason: "maintenance".to_string(),
            backend_transfer_hint: "lobby".to_string(),
            force: false,
            cancelled: false,
            version: 1,
        }),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let evacuation_server_id = register_server(&bus, "temp-s6-target").await;
    advertise_slot(&bus, &evacuation_server_id, "lobby:2:main", "lobby", 20).await;
    spawn_reservation_acceptor(bus.clone(), evacuation_server_id.clone(), "tok-s6-b".to_string());

    let mut metadata = HashMap::new();
    metadata.insert("shutdownIntentId".to_string(), serde_json::json!("intent-s6"));
    bus.broadcast(
        CH_PLAYER_REQUEST,
        BusMessage::PlayerSlotRequest(PlayerSlotRequestMessage {
            request_id: "req-s6-b".to_string(),
            player_id: "player-6".to_string(),
            player_name: "Player6".to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            family_id: "ignored-because-ticketed".to_string(),
            metadata,
        }),
    )
    .await
    .unwrap();

    let command = recv(&mut proxy_rx, |m| match m {
        BusMessage::PlayerRouteCommand(c) if c.request_id == "req-s6-b" => Some(c),
        _ => None,
    })
    .await;
    assert_eq!(command.action, RouteAction::Route);
    assert_eq!(command.server_id.as_deref(), Some(evacuation_server_id.as_str()));

    // The ticket was single-use; replaying the same shutdown-ticketed
    // request now finds no ticket left and gets disconnected.
    let mut metadata = HashMap::new();
    metadata.insert("shutdownIntentId".to_string(), serde_json::json!("intent-s6"));
    bus.broadcast(
        CH_PLAYER_REQUEST,
        BusMessage::PlayerSlotRequest(PlayerSlotRequestMessage {
            request_id: "req-s6-c".to_string(),
            player_id: "player-6".to_string(),
            player_name: "Player6".to_string(),
            proxy_id: "fulcrum-proxy-1".to_string(),
            family_id: "ignored-because-ticketed".to_string(),
            metadata,
        }),
    )
    .await
    .unwrap();

    let disconnect = recv(&mut proxy_rx, |m| match m {
        BusMessage::PlayerRouteCommand(c) if c.request_id == "req-s6-c" => Some(c),
        _ => None,
    })
    .await;
    assert_eq!(disconnect.action, RouteAction::Disconnect);
    assert_eq!(disconnect.reason.as_deref(), Some(disconnect_reason::SHUTDOWN_TICKET_MISSING));
}
