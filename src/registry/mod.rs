//! Proxy and server registries (C4/C5): active/unavailable pools with a
//! recycle window, serialized per-operation mutation, lock-free reads
//! against a `DashMap`, grounded on the connection-manager's atomic
//! entry-API bookkeeping and the KV mirror's CRUD shape.

pub mod proxy;
pub mod server;

pub use proxy::ProxyRegistry;
pub use server::ServerRegistry;

use std::time::Duration;

/// How long a deregistered/dead id stays in the unavailable pool before
/// its id is released back to the allocator.
pub const RECYCLE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// How recently an active entry must have registered at the same
/// `(address, port)` for a second announcement to be treated as a
/// duplicate rather than a new registration.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);

/// Cadence of the unavailable-pool cleanup sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
