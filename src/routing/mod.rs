//! Player routing coordinator (C9). The largest component in the crate:
//! incoming-request handling, slot selection, per-family queueing, the
//! reservation handshake, party/match-roster bookkeeping, dispatch,
//! acknowledgement and bounded retry (§4.9).

pub mod coordinator;
pub mod party;
pub mod queue;
pub mod reservation;
pub mod selection;
pub mod tracker;

pub use coordinator::RoutingCoordinator;

use tokio::time::Duration;

pub const ROUTE_TIMEOUT: Duration = Duration::from_secs(15);
pub const RESERVATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_QUEUE_WAIT: Duration = Duration::from_secs(45);
pub const RECENT_SLOT_TTL: Duration = Duration::from_secs(45);
pub const MAX_ROUTE_RETRIES: u32 = 3;
