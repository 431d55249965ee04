//! Core data model shared by every registry and routing component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Value type produced by [`crate::ids::IdAllocator`]; immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyIdentifier(pub u64);

impl ProxyIdentifier {
    pub fn canonical(self) -> String {
        format!("fulcrum-proxy-{}", self.0)
    }
}

impl fmt::Display for ProxyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentifier(pub u64);

impl ServerIdentifier {
    pub fn canonical(self) -> String {
        format!("fulcrum-server-{}", self.0)
    }
}

impl fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A node's liveness status as seen by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Available,
    Unavailable,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredProxy {
    pub id: ProxyIdentifier,
    pub address: String,
    pub port: u16,
    pub last_heartbeat: DateTime<Utc>,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlotStatus {
    Provisioning,
    Available,
    Allocated,
    Faulted,
    Cooldown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalSlot {
    pub slot_id: String,
    pub slot_suffix: String,
    pub server_id: ServerIdentifier,
    pub status: SlotStatus,
    pub online_players: u32,
    pub max_players: u32,
    /// Free-form extras; `family` is required for a slot to be routable,
    /// `variant` is optional. Never shadow a typed field through this map.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LogicalSlot {
    pub fn family(&self) -> Option<&str> {
        self.metadata.get("family").and_then(|v| v.as_str())
    }

    pub fn variants(&self) -> Vec<String> {
        self.metadata
            .get("variants")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remaining_capacity(&self, pending_occupancy: u32) -> i64 {
        i64::from(self.max_players) - i64::from(self.online_players) - i64::from(pending_occupancy)
    }

    pub fn routable(&self) -> bool {
        matches!(self.status, SlotStatus::Available | SlotStatus::Allocated) && self.family().is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredServer {
    pub id: ServerIdentifier,
    pub temp_id: String,
    pub server_type: String,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub max_capacity: u32,
    pub player_count: u32,
    pub tps: f64,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub slots: HashMap<String, LogicalSlot>,
    pub is_evacuating: bool,
}

/// §4.3 node registration state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    ReRegistering,
    Deregistering,
    Disconnected,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unregistered => "UNREGISTERED",
            Self::Registering => "REGISTERING",
            Self::Registered => "REGISTERED",
            Self::ReRegistering => "RE_REGISTERING",
            Self::Deregistering => "DEREGISTERING",
            Self::Disconnected => "DISCONNECTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRequest {
    pub request_id: String,
    pub player_id: String,
    pub player_name: String,
    pub proxy_id: String,
    pub family_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PlayerRequest {
    pub fn meta_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).and_then(|v| v.as_str()).map(str::to_owned)
    }
}

/// A request sitting in a family queue or in flight, carrying bookkeeping
/// not present on the wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRequestContext {
    pub request: PlayerRequest,
    pub created_at: DateTime<Utc>,
    pub last_enqueued_at: DateTime<Utc>,
    pub retries: u32,
    pub blocked_slots: Vec<String>,
    pub variant_id: Option<String>,
    pub preferred_slot_id: Option<String>,
    pub current_slot_id: Option<String>,
    pub previous_slot_id: Option<String>,
    pub is_rejoin: bool,
}

impl PlayerRequestContext {
    pub fn new(request: PlayerRequest) -> Self {
        let now = Utc::now();
        let variant_id = request.meta_str("variant");
        let preferred_slot_id = request.meta_str("rejoinSlotId");
        let current_slot_id = request.meta_str("currentSlotId");
        let previous_slot_id = request.meta_str("previousSlotId");
        let is_rejoin = preferred_slot_id.is_some();
        Self {
            request,
            created_at: now,
            last_enqueued_at: now,
            retries: 0,
            blocked_slots: Vec::new(),
            variant_id,
            preferred_slot_id,
            current_slot_id,
            previous_slot_id,
            is_rejoin,
        }
    }

    pub fn touch_enqueued(&mut self) {
        self.last_enqueued_at = Utc::now();
    }

    /// §4.9.1 step 4: the current/previous slot named in the request's
    /// metadata are blocked in addition to whatever the tracker already
    /// blocks for this player.
    pub fn metadata_blocked_slots(&self) -> impl Iterator<Item = &String> {
        self.current_slot_id.iter().chain(self.previous_slot_id.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightRoute {
    pub request_id: String,
    pub slot_id: String,
    pub server_id: ServerIdentifier,
    pub context: PlayerRequestContext,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyReservationState {
    Pending,
    Allocated,
    Claimed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyReservation {
    pub reservation_id: String,
    pub party_id: String,
    pub family_id: String,
    pub variant_id: Option<String>,
    pub target_server_id: Option<ServerIdentifier>,
    pub target_slot_id: Option<String>,
    pub reservation_token: Option<String>,
    pub players: Vec<String>,
    pub claimed_by: Vec<String>,
    pub state: PartyReservationState,
    pub created_at: DateTime<Utc>,
}

impl PartyReservation {
    pub fn fully_claimed(&self) -> bool {
        self.players.iter().all(|p| self.claimed_by.contains(p))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRoster {
    pub match_id: String,
    pub slot_id: String,
    pub server_id: ServerIdentifier,
    pub allowed_players: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownIntent {
    pub id: String,
    pub services: Vec<String>,
    pub countdown_seconds: u64,
    #[serde(default = "default_backend_transfer_hint")]
    pub backend_transfer_hint: String,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
}

pub fn default_backend_transfer_hint() -> String {
    "lobby".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownTicket {
    pub player_id: String,
    pub intent_id: String,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub profile_id: String,
    pub tag: String,
    pub server_ip: String,
    pub motd: Vec<String>,
    pub scoreboard_title: String,
    pub scoreboard_footer: String,
    pub ranks: HashMap<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}
