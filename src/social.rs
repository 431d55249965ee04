//! Friends / social mutation router (C12): applies a directed
//! `FriendMutationCommandMessage` to the in-memory relation graph and
//! broadcasts the outcome. Relation mutations (add/remove/block/unblock)
//! emit a [`FriendRelationEventMessage`]; invite-lifecycle mutations
//! (send/accept/decline) emit a [`FriendRequestEventMessage`] instead.
//! Every failure is reported back on the relation-event channel as a
//! negative ack carrying the original `requestId`, the same way the rest
//! of this crate reports a failed mutation to its originator.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::warn;

use crate::bus::SharedBus;
use crate::protocol::messages::{
    FriendMutationCommandMessage, FriendMutationType, FriendRelationEventMessage, FriendRequestEventMessage,
    CH_SOCIAL_FRIEND_RELATION_EVENT, CH_SOCIAL_FRIEND_REQUEST_EVENT,
};
use crate::protocol::{BusMessage, Validate};

/// Unordered pair key for a friendship edge: `(min(a,b), max(a,b))`.
type Pair = (String, String);

fn pair(a: &str, b: &str) -> Pair {
    if a <= b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) }
}

pub struct SocialRouter {
    friends: DashSet<Pair>,
    blocked: DashMap<String, std::collections::HashSet<String>>,
    /// Pending invites keyed by `(senderId, recipientId)`.
    pending_requests: DashSet<Pair>,
    bus: SharedBus,
}

impl SocialRouter {
    pub fn new(bus: SharedBus) -> Arc<Self> {
        Arc::new(Self { friends: DashSet::new(), blocked: DashMap::new(), pending_requests: DashSet::new(), bus })
    }

    fn is_blocked(&self, blocker: &str, blockee: &str) -> bool {
        self.blocked.get(blocker).is_some_and(|set| set.contains(blockee))
    }

    pub async fn handle_mutation(&self, msg: FriendMutationCommandMessage) {
        if let Err(err) = msg.validate() {
            warn!(error = %err, "dropping malformed friend mutation command");
            return;
        }

        let request_id = msg.request_id.clone();
        let actor_id = msg.actor_id.clone();
        let target_id = msg.target_id.clone();
        let mutation_type = msg.mutation_type;

        match mutation_type {
            FriendMutationType::AddFriend => {
                if self.is_blocked(&target_id, &actor_id) || self.is_blocked(&actor_id, &target_id) {
                    self.reject(request_id, mutation_type, actor_id, target_id, "blocked").await;
                    return;
                }
                self.friends.insert(pair(&actor_id, &target_id));
                self.accept_relation(request_id, mutation_type, actor_id, target_id).await;
            }
            FriendMutationType::RemoveFriend => {
                self.friends.remove(&pair(&actor_id, &target_id));
                self.accept_relation(request_id, mutation_type, actor_id, target_id).await;
            }
            FriendMutationType::Block => {
                self.friends.remove(&pair(&actor_id, &target_id));
                self.blocked.entry(actor_id.clone()).or_default().insert(target_id.clone());
                self.accept_relation(request_id, mutation_type, actor_id, target_id).await;
            }
            FriendMutationType::Unblock => {
                let was_blocked = self.blocked.get_mut(&actor_id).is_some_and(|mut set| set.remove(&target_id));
                if !was_blocked {
                    self.reject(request_id, mutation_type, actor_id, target_id, "not-blocked").await;
                    return;
                }
                self.accept_relation(request_id, mutation_type, actor_id, target_id).await;
            }
            FriendMutationType::SendRequest => {
                if self.is_blocked(&target_id, &actor_id) {
                    self.reject(request_id, mutation_type, actor_id, target_id, "blocked").await;
                    return;
                }
                if self.friends.contains(&pair(&actor_id, &target_id)) {
                    self.reject(request_id, mutation_type, actor_id, target_id, "already-friends").await;
                    return;
                }
                self.pending_requests.insert((actor_id.clone(), target_id.clone()));
                self.emit_request_event(request_id, actor_id, target_id, "sent").await;
            }
            FriendMutationType::AcceptRequest => {
                let invite = (target_id.clone(), actor_id.clone());
                if !self.pending_requests.remove(&invite).is_some() {
                    self.reject(request_id, mutation_type, actor_id, target_id, "request-not-found").await;
                    return;
                }
                self.friends.insert(pair(&actor_id, &target_id));
                self.emit_request_event(request_id, actor_id, target_id, "accepted").await;
            }
            FriendMutationType::DeclineRequest => {
                let invite = (target_id.clone(), actor_id.clone());
                if !self.pending_requests.remove(&invite).is_some() {
                    self.reject(request_id, mutation_type, actor_id, target_id, "request-not-found").await;
                    return;
                }
                self.emit_request_event(request_id, actor_id, target_id, "declined").await;
            }
        }
    }

    async fn accept_relation(&self, request_id: String, mutation_type: FriendMutationType, actor_id: String, target_id: String) {
        let event = FriendRelationEventMessage {
            request_id: Some(request_id), mutation_type, actor_id, target_id, success: true, reason: None,
        };
        let _ = self.bus.broadcast(CH_SOCIAL_FRIEND_RELATION_EVENT, BusMessage::FriendRelationEvent(event)).await;
    }

    async fn reject(&self, request_id: String, mutation_type: FriendMutationType, actor_id: String, target_id: String, reason: &str) {
        let event = FriendRelationEventMessage {
            request_id: Some(request_id),
            mutation_type,
            actor_id,
            target_id,
            success: false,
            reason: Some(reason.to_string()),
        };
        let _ = self.bus.broadcast(CH_SOCIAL_FRIEND_RELATION_EVENT, BusMessage::FriendRelationEvent(event)).await;
    }

    async fn emit_request_event(&self, request_id: String, actor_id: String, target_id: String, event: &str) {
        let msg = FriendRequestEventMessage {
            request_id: Some(request_id), actor_id, target_id, event: event.to_string(),
        };
        let _ = self.bus.broadcast(CH_SOCIAL_FRIEND_REQUEST_EVENT, BusMessage::FriendRequestEvent(msg)).await;
    }

    pub fn are_friends(&self, a: &str, b: &str) -> bool {
        self.friends.contains(&pair(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, InMemoryBus};

    fn router() -> (Arc<SocialRouter>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        (SocialRouter::new(Arc::clone(&bus) as SharedBus), bus)
    }

    fn command(mutation_type: FriendMutationType, actor_id: &str, target_id: &str) -> FriendMutationCommandMessage {
        FriendMutationCommandMessage {
            request_id: "r1".to_string(),
            mutation_type,
            actor_id: actor_id.to_string(),
            target_id: target_id.to_string(),
            scope: None,
            expires_at: None,
            reason: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn full_invite_lifecycle_ends_in_friendship() {
        let (router, bus) = router();
        let (_, mut rx) = bus.subscribe(CH_SOCIAL_FRIEND_REQUEST_EVENT).await;

        router.handle_mutation(command(FriendMutationType::SendRequest, "p1", "p2")).await;
        let sent = rx.recv().await.unwrap();
        assert!(matches!(sent.message, BusMessage::FriendRequestEvent(m) if m.event == "sent"));

        router.handle_mutation(command(FriendMutationType::AcceptRequest, "p2", "p1")).await;
        let accepted = rx.recv().await.unwrap();
        assert!(matches!(accepted.message, BusMessage::FriendRequestEvent(m) if m.event == "accepted"));
        assert!(router.are_friends("p1", "p2"));
    }

    #[tokio::test]
    async fn accepting_a_request_that_was_never_sent_is_rejected() {
        let (router, bus) = router();
        let (_, mut rx) = bus.subscribe(CH_SOCIAL_FRIEND_RELATION_EVENT).await;

        router.handle_mutation(command(FriendMutationType::AcceptRequest, "p2", "p1")).await;
        let envelope = rx.recv().await.unwrap();
        match envelope.message {
            BusMessage::FriendRelationEvent(m) => {
                assert!(!m.success);
                assert_eq!(m.reason.as_deref(), Some("request-not-found"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(!router.are_friends("p1", "p2"));
    }

    #[tokio::test]
    async fn blocked_player_cannot_send_a_request() {
        let (router, bus) = router();
        router.handle_mutation(command(FriendMutationType::Block, "p2", "p1")).await;
        let (_, mut rx) = bus.subscribe(CH_SOCIAL_FRIEND_RELATION_EVENT).await;

        router.handle_mutation(command(FriendMutationType::SendRequest, "p1", "p2")).await;
        let envelope = rx.recv().await.unwrap();
        match envelope.message {
            BusMessage::FriendRelationEvent(m) => assert_eq!(m.reason.as_deref(), Some("blocked")),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
