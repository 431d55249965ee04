//! §4.9.4 reservation handshake: a short request/response round trip with
//! the target backend before a route is ever dispatched.

use tokio::time::timeout;
use uuid::Uuid;

use crate::bus::SharedBus;
use crate::protocol::disconnect_reason;
use crate::protocol::messages::{
    server_player_route_channel, PlayerReservationRequest, CH_PLAYER_RESERVATION_RESPONSE,
};
use crate::protocol::BusMessage;
use crate::routing::RESERVATION_TIMEOUT;

pub enum ReservationOutcome {
    Accepted { token: String },
    Retry { reason: String },
}

/// Sends a `PlayerReservationRequest` to `server_id` and waits up to
/// `RESERVATION_TIMEOUT` for a matching response. Never returns an error
/// of its own — every failure mode resolves to a retryable outcome,
/// matching §4.9.4's exhaustive outcome list.
pub async fn request_reservation(
    bus: &SharedBus,
    player_id: &str,
    player_name: &str,
    proxy_id: &str,
    server_id: &str,
    slot_id: &str,
) -> ReservationOutcome {
    let request_id = Uuid::new_v4().to_string();
    let (subscriber_id, mut rx) = bus.subscribe(CH_PLAYER_RESERVATION_RESPONSE).await;

    let request = PlayerReservationRequest {
        request_id: request_id.clone(),
        player_id: player_id.to_string(),
        player_name: player_name.to_string(),
        proxy_id: proxy_id.to_string(),
        server_id: server_id.to_string(),
        slot_id: slot_id.to_string(),
        metadata: Default::default(),
    };

    let channel = server_player_route_channel(server_id);
    if let Err(_err) = bus.send(server_id, &channel, BusMessage::PlayerReservationRequest(request)).await {
        bus.unsubscribe(CH_PLAYER_RESERVATION_RESPONSE, subscriber_id).await;
        return ReservationOutcome::Retry { reason: "connection-failed".to_string() };
    }

    let awaited = timeout(RESERVATION_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(envelope) => {
                    if let BusMessage::PlayerReservationResponse(response) = envelope.message {
                        if response.request_id == request_id {
                            return Some(response);
                        }
                    }
                }
                None => return None,
            }
        }
    })
    .await;

    bus.unsubscribe(CH_PLAYER_RESERVATION_RESPONSE, subscriber_id).await;

    match awaited {
        Ok(Some(response)) if response.accepted => match response.reservation_token {
            Some(token) => ReservationOutcome::Accepted { token },
            None => ReservationOutcome::Retry { reason: disconnect_reason::RESERVATION_MISSING_TOKEN.to_string() },
        },
        Ok(Some(response)) => ReservationOutcome::Retry {
            reason: response.reason.unwrap_or_else(|| disconnect_reason::RESERVATION_REJECTED.to_string()),
        },
        Ok(None) | Err(_) => ReservationOutcome::Retry { reason: disconnect_reason::RESERVATION_FAILED.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, InMemoryBus};
    use crate::protocol::messages::PlayerReservationResponse;

    #[tokio::test]
    async fn accepted_response_with_token_is_returned() {
        let bus: SharedBus = std::sync::Arc::new(InMemoryBus::new());
        let (_id, mut server_rx) = bus.subscribe(&server_player_route_channel("fulcrum-server-1")).await;

        let bus_clone = bus.clone();
        let responder = tokio::spawn(async move {
            let envelope = server_rx.recv().await.unwrap();
            let BusMessage::PlayerReservationRequest(req) = envelope.message else { panic!("wrong message") };
            bus_clone
                .broadcast(
                    CH_PLAYER_RESERVATION_RESPONSE,
                    BusMessage::PlayerReservationResponse(PlayerReservationResponse {
                        request_id: req.request_id,
                        server_id: req.server_id,
                        accepted: true,
                        reservation_token: Some("tok-1".to_string()),
                        reason: None,
                    }),
                )
                .await
                .unwrap();
        });

        let outcome = request_reservation(&bus, "p1", "Player1", "fulcrum-proxy-1", "fulcrum-server-1", "lobby:1").await;
        responder.await.unwrap();
        match outcome {
            ReservationOutcome::Accepted { token } => assert_eq!(token, "tok-1"),
            ReservationOutcome::Retry { reason } => panic!("expected acceptance, got retry: {reason}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_response_times_out_into_retry() {
        let bus: SharedBus = std::sync::Arc::new(InMemoryBus::new());
        let outcome = request_reservation(&bus, "p1", "Player1", "fulcrum-proxy-1", "fulcrum-server-unknown", "lobby:1").await;
        assert!(matches!(outcome, ReservationOutcome::Retry { .. }));
    }
}
