//! §4.9.5 party reservations and match rosters.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use crate::ids::{parse_numeric_suffix, IdKind};
use crate::kv::{self, keys, Kv};
use crate::protocol::messages::{MatchRosterCreatedMessage, MatchRosterEndedMessage, PartyReservationCreatedMessage};
use crate::protocol::{MatchRoster, PartyReservation, PartyReservationState, ServerIdentifier};

pub struct PartyCoordinator {
    reservations: DashMap<String, PartyReservation>,
    rosters: DashMap<String, MatchRoster>,
    kv: Arc<dyn Kv>,
}

impl PartyCoordinator {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { reservations: DashMap::new(), rosters: DashMap::new(), kv }
    }

    pub async fn load_from_kv(&self) {
        if let Ok(entries) = self.kv.scan_prefix("party:reservation:").await {
            for (key, value) in entries {
                match serde_json::from_value::<PartyReservation>(value) {
                    Ok(reservation) => {
                        self.reservations.insert(reservation.reservation_id.clone(), reservation);
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted party reservation"),
                }
            }
        }
        if let Ok(entries) = self.kv.scan_prefix("match:roster:").await {
            for (key, value) in entries {
                match serde_json::from_value::<MatchRoster>(value) {
                    Ok(roster) => {
                        self.rosters.insert(roster.slot_id.clone(), roster);
                    }
                    Err(err) => warn!(key, error = %err, "failed to decode persisted match roster"),
                }
            }
        }
    }

    fn server_identifier(raw: &Option<String>) -> Option<ServerIdentifier> {
        raw.as_deref().and_then(|id| parse_numeric_suffix(id, IdKind::Server)).map(ServerIdentifier)
    }

    pub async fn record_reservation(&self, msg: PartyReservationCreatedMessage) -> PartyReservation {
        let reservation = PartyReservation {
            reservation_id: msg.reservation_id.clone(),
            party_id: msg.party_id,
            family_id: msg.family_id,
            variant_id: msg.variant_id,
            target_server_id: Self::server_identifier(&msg.target_server_id),
            target_slot_id: msg.target_slot_id,
            reservation_token: msg.reservation_token,
            players: msg.players,
            claimed_by: Vec::new(),
            state: PartyReservationState::Pending,
            created_at: Utc::now(),
        };
        self.reservations.insert(reservation.reservation_id.clone(), reservation.clone());
        let _ = kv::put_typed(self.kv.as_ref(), &keys::party_reservation(&reservation.reservation_id), &reservation).await;
        reservation
    }

    pub fn get(&self, reservation_id: &str) -> Option<PartyReservation> {
        self.reservations.get(reservation_id).map(|r| r.clone())
    }

    /// Records a player's claim against a party reservation, advancing its
    /// state to CLAIMED once every member has claimed.
    pub async fn claim(&self, reservation_id: &str, player_id: &str) -> Option<PartyReservation> {
        let mut entry = self.reservations.get_mut(reservation_id)?;
        if !entry.claimed_by.iter().any(|p| p == player_id) {
            entry.claimed_by.push(player_id.to_string());
        }
        if entry.fully_claimed() {
            entry.state = PartyReservationState::Claimed;
        }
        let snapshot = entry.clone();
        drop(entry);
        let _ = kv::put_typed(self.kv.as_ref(), &keys::party_reservation(reservation_id), &snapshot).await;
        Some(snapshot)
    }

    pub async fn expire(&self, reservation_id: &str) {
        if let Some(mut entry) = self.reservations.get_mut(reservation_id) {
            entry.state = PartyReservationState::Expired;
        }
        let _ = self.kv.delete(&keys::party_reservation(reservation_id)).await;
    }

    pub async fn record_roster(&self, msg: MatchRosterCreatedMessage) {
        let Some(server_id) = parse_numeric_suffix(&msg.server_id, IdKind::Server).map(ServerIdentifier) else {
            warn!(server_id = %msg.server_id, "match roster references an unparseable server id");
            return;
        };
        let roster = MatchRoster {
            match_id: msg.match_id,
            slot_id: msg.slot_id.clone(),
            server_id,
            allowed_players: msg.players,
            created_at: msg.created_at,
            ended_at: None,
        };
        self.rosters.insert(msg.slot_id.clone(), roster.clone());
        let _ = kv::put_typed(self.kv.as_ref(), &keys::match_roster(&msg.slot_id), &roster).await;
    }

    pub fn roster_for_slot(&self, slot_id: &str) -> Option<MatchRoster> {
        self.rosters.get(slot_id).filter(|r| r.ended_at.is_none()).map(|r| r.clone())
    }

    pub async fn end_roster(&self, msg: MatchRosterEndedMessage) {
        if let Some(mut roster) = self.rosters.get_mut(&msg.slot_id) {
            roster.ended_at = Some(msg.ended_at);
        }
        let _ = self.kv.delete(&keys::match_roster(&msg.slot_id)).await;
    }

    /// §4.9.5: while a roster is present for `slot_id`, only its members
    /// may be routed there.
    pub fn is_player_allowed(&self, slot_id: &str, player_id: &str) -> bool {
        match self.roster_for_slot(slot_id) {
            Some(roster) => roster.allowed_players.iter().any(|p| p == player_id),
            None => true,
        }
    }
}
