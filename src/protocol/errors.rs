//! Stable disconnect-reason identifiers and the retryable-reason set used
//! by the routing coordinator. Rendering a human-facing string from one of
//! these is the proxy's concern, not the core's.

/// Reasons a `PlayerRouteAck{status=FAILED}` can carry that the routing
/// coordinator treats as transient and worth retrying (§4.9.8).
pub const RETRYABLE_REASONS: &[&str] = &[
    "backend-not-found",
    "backend-offline",
    "connection-failed",
    "slot-not-ready",
    "route-transient",
];

pub fn is_retryable_reason(reason: &str) -> bool {
    RETRYABLE_REASONS.contains(&reason)
}

pub mod disconnect_reason {
    pub const SHUTDOWN_TICKET_MISSING: &str = "shutdown-ticket-missing";
    pub const UNKNOWN_PROXY: &str = "unknown-proxy";
    pub const QUEUE_TIMEOUT: &str = "queue-timeout";
    pub const MATCH_ROSTER_LOCKED: &str = "match-roster-locked";
    pub const RESERVATION_MISSING_TOKEN: &str = "reservation-missing-token";
    pub const RESERVATION_FAILED: &str = "reservation-failed";
    pub const RESERVATION_REJECTED: &str = "reservation-rejected";
    pub const ROUTE_TIMEOUT: &str = "route-timeout";
    pub const SLOT_UNAVAILABLE: &str = "slot-unavailable";
    pub const PARTY_RESERVATION_EXPIRED: &str = "party-reservation-expired";
}

/// Acked, not disconnected — the proxy decides what to do next (§4.9.1 step 5).
pub mod ack_reason {
    pub const REJOIN_SLOT_UNAVAILABLE: &str = "rejoin-slot-unavailable";
}
