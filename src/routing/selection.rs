//! §4.9.2 slot selection: among eligible candidates, pack players into the
//! fullest acceptable slot to minimize fragmentation.

use crate::protocol::LogicalSlot;

/// Slots a candidate must not land in: the player's current slot, previous
/// slot, and up to three recently-assigned slots (§4.9.1 step 4).
#[derive(Debug, Clone, Default)]
pub struct BlockedSlotContext {
    pub blocked_slot_ids: Vec<String>,
}

impl BlockedSlotContext {
    pub fn is_blocked(&self, slot_id: &str) -> bool {
        self.blocked_slot_ids.iter().any(|b| b == slot_id)
    }
}

fn fill_ratio(slot: &LogicalSlot, pending: u32) -> f64 {
    if slot.max_players == 0 {
        return 0.0;
    }
    f64::from(slot.online_players + pending) / f64::from(slot.max_players)
}

/// Selects the best eligible slot among `candidates`. `pending_occupancy`
/// and `first_seen` are injected so callers can source them from whatever
/// bookkeeping they keep (in-flight reservation counts, slot discovery
/// order) without this function owning that state.
pub fn find_available_slot<'a>(
    candidates: &'a [LogicalSlot],
    family: &str,
    variant: Option<&str>,
    blocked: &BlockedSlotContext,
    pending_occupancy: impl Fn(&str) -> u32,
    first_seen: impl Fn(&str) -> i64,
) -> Option<&'a LogicalSlot> {
    let mut eligible: Vec<&LogicalSlot> = candidates
        .iter()
        .filter(|slot| slot.routable())
        .filter(|slot| slot.family() == Some(family))
        .filter(|slot| match variant {
            None => true,
            Some(v) => slot.variants().iter().any(|sv| sv == v),
        })
        .filter(|slot| !blocked.is_blocked(&slot.slot_id))
        .filter(|slot| slot.remaining_capacity(pending_occupancy(&slot.slot_id)) > 0)
        .collect();

    eligible.sort_by(|a, b| {
        let pa = pending_occupancy(&a.slot_id);
        let pb = pending_occupancy(&b.slot_id);
        fill_ratio(b, pb)
            .partial_cmp(&fill_ratio(a, pa))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (b.online_players + pb).cmp(&(a.online_players + pa)))
            .then_with(|| a.remaining_capacity(pa).cmp(&b.remaining_capacity(pb)))
            .then_with(|| first_seen(&a.slot_id).cmp(&first_seen(&b.slot_id)))
    });

    eligible.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn slot(id: &str, family: &str, online: u32, max: u32) -> LogicalSlot {
        LogicalSlot {
            slot_id: id.to_string(),
            slot_suffix: id.to_string(),
            server_id: crate::protocol::ServerIdentifier(1),
            status: crate::protocol::SlotStatus::Available,
            online_players: online,
            max_players: max,
            metadata: HashMap::from([("family".to_string(), serde_json::json!(family))]),
        }
    }

    #[test]
    fn packs_into_the_fullest_slot_with_room() {
        let slots = vec![slot("a", "lobby", 2, 20), slot("b", "lobby", 18, 20)];
        let blocked = BlockedSlotContext::default();
        let chosen = find_available_slot(&slots, "lobby", None, &blocked, |_| 0, |_| 0).unwrap();
        assert_eq!(chosen.slot_id, "b");
    }

    #[test]
    fn full_slots_are_excluded() {
        let slots = vec![slot("a", "lobby", 20, 20)];
        let blocked = BlockedSlotContext::default();
        assert!(find_available_slot(&slots, "lobby", None, &blocked, |_| 0, |_| 0).is_none());
    }

    #[test]
    fn blocked_slot_is_skipped_even_if_it_has_room() {
        let slots = vec![slot("a", "lobby", 2, 20)];
        let blocked = BlockedSlotContext { blocked_slot_ids: vec!["a".to_string()] };
        assert!(find_available_slot(&slots, "lobby", None, &blocked, |_| 0, |_| 0).is_none());
    }

    #[test]
    fn family_mismatch_is_excluded() {
        let slots = vec![slot("a", "arena", 2, 20)];
        let blocked = BlockedSlotContext::default();
        assert!(find_available_slot(&slots, "lobby", None, &blocked, |_| 0, |_| 0).is_none());
    }
}
