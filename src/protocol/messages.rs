//! Bus message catalog: one tagged enum covering every channel in the
//! external channel table, plus the well-known channel constants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Fixed channel constants. Per-proxy and per-server channels are derived
// with `player_route_channel`/`server_player_route_channel` below.
pub const CH_SERVER_REGISTRATION_REQUEST: &str = "server.registration.request";
pub const CH_SERVER_REGISTRATION_RESPONSE: &str = "server.registration.response";
pub const CH_SERVER_REMOVAL: &str = "server.removal";
pub const CH_SERVER_EVACUATION_REQUEST: &str = "server.evacuation.request";
pub const CH_SERVER_EVACUATION_RESPONSE: &str = "server.evacuation.response";
pub const CH_HEARTBEAT: &str = "heartbeat";
pub const CH_STATUS_CHANGE: &str = "status.change";
pub const CH_REGISTRY_REREG_REQUEST: &str = "registry.rereg.request";
pub const CH_PROXY_ANNOUNCEMENT: &str = "proxy.announcement";
pub const CH_SLOT_FAMILY_ADVERTISEMENT: &str = "slot.family.advertisement";
pub const CH_SLOT_STATUS: &str = "slot.status";
pub const CH_PLAYER_REQUEST: &str = "player.request";
pub const CH_PLAYER_RESERVATION_REQUEST: &str = "player.reservation.request";
pub const CH_PLAYER_RESERVATION_RESPONSE: &str = "player.reservation.response";
pub const CH_PLAYER_ROUTE_ACK: &str = "player.route.ack";
pub const CH_REGISTRY_ENVIRONMENT_ROUTE_REQUEST: &str = "registry.environment.route.request";
pub const CH_PARTY_RESERVATION_CREATED: &str = "party.reservation.created";
pub const CH_PARTY_RESERVATION_CLAIMED: &str = "party.reservation.claimed";
pub const CH_MATCH_ROSTER_CREATED: &str = "match.roster.created";
pub const CH_MATCH_ROSTER_ENDED: &str = "match.roster.ended";
pub const CH_REGISTRY_SHUTDOWN_INTENT: &str = "registry.shutdown.intent";
pub const CH_REGISTRY_SHUTDOWN_UPDATE: &str = "registry.shutdown.update";
pub const CH_REGISTRY_NETWORK_CONFIG_REQUEST: &str = "registry.network.config.request";
pub const CH_REGISTRY_NETWORK_CONFIG_UPDATED: &str = "registry.network.config.updated";
pub const CH_REGISTRY_RANK_UPDATE: &str = "registry.rank.update";
pub const CH_SOCIAL_FRIEND_MUTATION_REQUEST: &str = "social.friend.mutation.request";
pub const CH_SOCIAL_FRIEND_RELATION_EVENT: &str = "social.friend.relation.event";
pub const CH_SOCIAL_FRIEND_REQUEST_EVENT: &str = "social.friend.request.event";

pub fn player_route_channel(proxy_id: &str) -> String {
    format!("player.route.{proxy_id}")
}

pub fn server_player_route_channel(server_id: &str) -> String {
    format!("server.player.route.{server_id}")
}

/// Every message that crosses the bus is one variant of this enum, tagged
/// by `messageType` on the wire with the body under `body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "body")]
pub enum BusMessage {
    #[serde(rename = "server.registration.request")]
    ServerRegistrationRequest(ServerRegistrationRequest),
    #[serde(rename = "server.registration.response")]
    ServerRegistrationResponse(ServerRegistrationResponse),
    #[serde(rename = "server.removal")]
    ServerRemoval(ServerRemoval),
    #[serde(rename = "server.evacuation.request")]
    ServerEvacuationRequest(ServerEvacuationRequest),
    #[serde(rename = "server.evacuation.response")]
    ServerEvacuationResponse(ServerEvacuationResponse),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatMessage),
    #[serde(rename = "status.change")]
    StatusChange(StatusChangeMessage),
    #[serde(rename = "registry.rereg.request")]
    RegistryReregRequest(RegistryReregRequest),
    #[serde(rename = "proxy.announcement")]
    ProxyAnnouncement(ProxyAnnouncement),
    #[serde(rename = "slot.family.advertisement")]
    SlotFamilyAdvertisement(SlotFamilyAdvertisement),
    #[serde(rename = "slot.status")]
    SlotStatusUpdate(SlotStatusUpdate),
    #[serde(rename = "player.request")]
    PlayerSlotRequest(PlayerSlotRequestMessage),
    #[serde(rename = "player.reservation.request")]
    PlayerReservationRequest(PlayerReservationRequest),
    #[serde(rename = "player.reservation.response")]
    PlayerReservationResponse(PlayerReservationResponse),
    #[serde(rename = "player.route.command")]
    PlayerRouteCommand(PlayerRouteCommand),
    #[serde(rename = "player.route.ack")]
    PlayerRouteAck(PlayerRouteAck),
    #[serde(rename = "registry.environment.route.request")]
    EnvironmentRouteRequest(EnvironmentRouteRequestMessage),
    #[serde(rename = "party.reservation.created")]
    PartyReservationCreated(PartyReservationCreatedMessage),
    #[serde(rename = "party.reservation.claimed")]
    PartyReservationClaimed(PartyReservationClaimedMessage),
    #[serde(rename = "match.roster.created")]
    MatchRosterCreated(MatchRosterCreatedMessage),
    #[serde(rename = "match.roster.ended")]
    MatchRosterEnded(MatchRosterEndedMessage),
    #[serde(rename = "registry.shutdown.intent")]
    ShutdownIntentMessage(ShutdownIntentMessage),
    #[serde(rename = "registry.shutdown.update")]
    ShutdownIntentUpdateMessage(ShutdownIntentUpdateMessage),
    #[serde(rename = "registry.network.config.request")]
    NetworkConfigRequest(NetworkConfigRequestMessage),
    #[serde(rename = "registry.network.config.updated")]
    NetworkConfigUpdated(NetworkConfigUpdatedMessage),
    #[serde(rename = "registry.rank.update")]
    RankSync(RankSyncMessage),
    #[serde(rename = "social.friend.mutation.request")]
    FriendMutationCommand(FriendMutationCommandMessage),
    #[serde(rename = "social.friend.relation.event")]
    FriendRelationEvent(FriendRelationEventMessage),
    #[serde(rename = "social.friend.request.event")]
    FriendRequestEvent(FriendRequestEventMessage),
}

/// Trivial blank-field validation shared by every inbound message type.
/// Handlers call this before acting; a failure is logged and the message
/// is dropped, never propagated into the bus dispatch thread.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

fn require_non_blank(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("missing or blank required field `{field}`"))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistrationRequest {
    pub temp_id: String,
    pub server_type: String,
    pub max_capacity: u32,
    pub address: String,
    pub port: u16,
    pub role: String,
    #[serde(default)]
    pub version: Option<i64>,
}

impl Validate for ServerRegistrationRequest {
    fn validate(&self) -> Result<(), String> {
        require_non_blank("tempId", &self.temp_id)?;
        require_non_blank("serverType", &self.server_type)?;
        require_non_blank("address", &self.address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistrationResponse {
    pub temp_id: String,
    pub assigned_server_id: String,
    pub success: bool,
    pub message: String,
    pub server_type: String,
    pub address: String,
    pub port: u16,
    pub proxy_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRemoval {
    pub server_id: String,
    pub server_type: String,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvacuationRequest {
    pub server_id: String,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default = "default_evacuation_timeout_millis")]
    pub timeout_millis: u64,
}

pub fn default_evacuation_timeout_millis() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvacuationResponse {
    pub server_id: String,
    pub success: bool,
    pub players_evacuated: u32,
    pub players_failed: u32,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub node_id: String,
    pub player_count: u32,
    pub tps: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Validate for HeartbeatMessage {
    fn validate(&self) -> Result<(), String> {
        require_non_blank("nodeId", &self.node_id)
    }
}

/// §4.7 liveness classification crossing AVAILABLE↔UNAVAILABLE. One
/// broadcast per transition, never on a no-op re-classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeMessage {
    pub node_id: String,
    pub status: crate::protocol::types::NodeStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryReregRequest {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub reason: String,
    pub force_reregistration: bool,
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAnnouncement {
    pub proxy_id: String,
    pub proxy_index: u32,
    pub hard_cap: u32,
    pub soft_cap: u32,
    pub current_player_count: u32,
    pub address: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Validate for ProxyAnnouncement {
    fn validate(&self) -> Result<(), String> {
        require_non_blank("proxyId", &self.proxy_id)?;
        require_non_blank("address", &self.address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotFamilyAdvertisement {
    pub server_id: String,
    pub family_capacities: HashMap<String, u32>,
    pub family_variants: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatusUpdate {
    pub server_id: String,
    pub slot_id: String,
    pub status: crate::protocol::types::SlotStatus,
    pub online_players: u32,
    pub max_players: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Validate for SlotStatusUpdate {
    fn validate(&self) -> Result<(), String> {
        require_non_blank("serverId", &self.server_id)?;
        require_non_blank("slotId", &self.slot_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSlotRequestMessage {
    pub request_id: String,
    pub player_id: String,
    pub player_name: String,
    pub proxy_id: String,
    pub family_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Validate for PlayerSlotRequestMessage {
    fn validate(&self) -> Result<(), String> {
        require_non_blank("requestId", &self.request_id)?;
        require_non_blank("playerId", &self.player_id)?;
        require_non_blank("proxyId", &self.proxy_id)?;
        require_non_blank("familyId", &self.family_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerReservationRequest {
    pub request_id: String,
    pub player_id: String,
    pub player_name: String,
    pub proxy_id: String,
    pub server_id: String,
    pub slot_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerReservationResponse {
    pub request_id: String,
    pub server_id: String,
    pub accepted: bool,
    pub reservation_token: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteAction {
    Route,
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRouteCommand {
    pub action: RouteAction,
    pub request_id: String,
    pub player_id: String,
    pub player_name: String,
    pub proxy_id: String,
    pub server_id: Option<String>,
    pub slot_id: Option<String>,
    pub slot_suffix: Option<String>,
    pub target_world: Option<String>,
    pub spawn_x: f64,
    pub spawn_y: f64,
    pub spawn_z: f64,
    pub spawn_yaw: f64,
    pub spawn_pitch: f64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Present only for `action=DISCONNECT`.
    pub reason: Option<String>,
    #[serde(default = "default_route_command_version")]
    pub version: i64,
}

pub fn default_route_command_version() -> i64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteAckStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRouteAck {
    pub request_id: String,
    pub player_id: String,
    pub proxy_id: String,
    pub status: RouteAckStatus,
    pub reason: Option<String>,
    pub slot_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentRouteFailureMode {
    KickOnFail,
    ReportOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRouteRequestMessage {
    pub request_id: String,
    pub player_id: String,
    pub player_name: String,
    pub proxy_id: String,
    pub origin_server_id: String,
    pub target_environment_id: String,
    pub target_server_id: Option<String>,
    pub world_name: Option<String>,
    #[serde(default)]
    pub spawn_x: f64,
    #[serde(default)]
    pub spawn_y: f64,
    #[serde(default)]
    pub spawn_z: f64,
    pub failure_mode: EnvironmentRouteFailureMode,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyReservationCreatedMessage {
    pub reservation_id: String,
    pub party_id: String,
    pub family_id: String,
    pub variant_id: Option<String>,
    pub target_server_id: Option<String>,
    pub target_slot_id: Option<String>,
    pub reservation_token: Option<String>,
    pub players: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyReservationClaimedMessage {
    pub reservation_id: String,
    pub player_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRosterCreatedMessage {
    pub match_id: String,
    pub slot_id: String,
    pub server_id: String,
    pub players: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRosterEndedMessage {
    pub match_id: String,
    pub slot_id: String,
    pub ended_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownIntentMessage {
    pub id: String,
    pub services: Vec<String>,
    pub countdown_seconds: u64,
    pub reason: String,
    #[serde(default = "crate::protocol::types::default_backend_transfer_hint")]
    pub backend_transfer_hint: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default = "default_route_command_version")]
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShutdownPhase {
    Evacuate,
    Evict,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownIntentUpdateMessage {
    pub intent_id: String,
    pub service_id: String,
    pub phase: ShutdownPhase,
    #[serde(default)]
    pub player_ids: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default = "default_route_command_version")]
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfigRequestMessage {
    pub requester_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfigUpdatedMessage {
    pub profile: crate::protocol::types::NetworkProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankSyncMessage {
    pub player_id: String,
    pub primary_rank_id: String,
    pub rank_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FriendMutationType {
    AddFriend,
    RemoveFriend,
    SendRequest,
    AcceptRequest,
    DeclineRequest,
    Block,
    Unblock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendMutationCommandMessage {
    pub request_id: String,
    pub mutation_type: FriendMutationType,
    pub actor_id: String,
    pub target_id: String,
    pub scope: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Validate for FriendMutationCommandMessage {
    fn validate(&self) -> Result<(), String> {
        require_non_blank("requestId", &self.request_id)?;
        require_non_blank("actorId", &self.actor_id)?;
        require_non_blank("targetId", &self.target_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRelationEventMessage {
    pub request_id: Option<String>,
    pub mutation_type: FriendMutationType,
    pub actor_id: String,
    pub target_id: String,
    pub success: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestEventMessage {
    pub request_id: Option<String>,
    pub actor_id: String,
    pub target_id: String,
    pub event: String,
}
