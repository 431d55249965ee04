//! Lowest-free-positive-integer identifier allocation for proxies and
//! servers (C2). Allocation and release are serialized behind a single
//! mutex per kind so the check-then-insert is atomic, the same discipline
//! `InMemoryDistributedLock::try_acquire` uses for lock acquisition.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Proxy,
    Server,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            IdKind::Proxy => "fulcrum-proxy",
            IdKind::Server => "fulcrum-server",
        }
    }
}

struct AllocatorState {
    active: BTreeSet<u64>,
    reserved: BTreeSet<u64>,
}

impl AllocatorState {
    fn held(&self, n: u64) -> bool {
        self.active.contains(&n) || self.reserved.contains(&n)
    }

    fn lowest_free(&self) -> u64 {
        let mut n = 1u64;
        while self.held(n) {
            n += 1;
        }
        n
    }
}

/// Allocates `fulcrum-<kind>-<n>` identifiers with the lowest available
/// positive integer, honoring a reservation window on release so a
/// recently-freed id is not immediately handed back out.
pub struct IdAllocator {
    kind: IdKind,
    state: Mutex<AllocatorState>,
    release_window: Duration,
}

impl IdAllocator {
    pub fn new(kind: IdKind, release_window: Duration) -> Self {
        Self {
            kind,
            state: Mutex::new(AllocatorState {
                active: BTreeSet::new(),
                reserved: BTreeSet::new(),
            }),
            release_window,
        }
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// Returns the lowest positive integer not currently active or
    /// reserved, formatted as `fulcrum-<kind>-N`, and marks it active.
    pub async fn allocate(&self) -> String {
        let mut state = self.state.lock().await;
        let n = state.lowest_free();
        if !state.active.insert(n) {
            // The set already reported this as free; an id can only be in
            // `active` here if `held` lied, which is an integrity bug.
            error!(kind = ?self.kind, id = n, "id allocator detected a collision on allocation");
            panic!("fulcrum id allocator collision for {:?} id {n}", self.kind);
        }
        format!("{}-{}", self.kind.prefix(), n)
    }

    /// Marks `numeric_id` as held without going through `allocate`, used
    /// when restoring a snapshot from the KV mirror on boot.
    pub async fn reserve_existing(&self, numeric_id: u64) {
        let mut state = self.state.lock().await;
        if !state.active.insert(numeric_id) {
            error!(kind = ?self.kind, id = numeric_id, "id allocator detected a collision restoring an existing id");
            panic!("fulcrum id allocator collision for {:?} id {numeric_id}", self.kind);
        }
    }

    /// Releases `numeric_id`. If `forced`, it becomes allocatable again
    /// immediately; otherwise it moves into the reservation window first.
    pub async fn release(self: &Arc<Self>, numeric_id: u64, forced: bool) {
        {
            let mut state = self.state.lock().await;
            state.active.remove(&numeric_id);
            if forced {
                state.reserved.remove(&numeric_id);
                return;
            }
            state.reserved.insert(numeric_id);
        }

        let this = Arc::clone(self);
        let window = self.release_window;
        tokio::spawn(async move {
            sleep(window).await;
            let mut state = this.state.lock().await;
            state.reserved.remove(&numeric_id);
        });
    }
}

pub fn parse_numeric_suffix(id: &str, kind: IdKind) -> Option<u64> {
    id.strip_prefix(kind.prefix())?.strip_prefix('-')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_lowest_free_id() {
        let alloc = IdAllocator::new(IdKind::Proxy, Duration::from_millis(10));
        assert_eq!(alloc.allocate().await, "fulcrum-proxy-1");
        assert_eq!(alloc.allocate().await, "fulcrum-proxy-2");
    }

    #[tokio::test]
    async fn forced_release_makes_id_immediately_reusable() {
        let alloc = Arc::new(IdAllocator::new(IdKind::Server, Duration::from_secs(300)));
        let id = alloc.allocate().await;
        let n = parse_numeric_suffix(&id, IdKind::Server).unwrap();
        alloc.release(n, true).await;
        assert_eq!(alloc.allocate().await, "fulcrum-server-1");
    }

    #[tokio::test]
    async fn unforced_release_holds_id_during_window() {
        let alloc = Arc::new(IdAllocator::new(IdKind::Server, Duration::from_millis(50)));
        let id = alloc.allocate().await;
        let n = parse_numeric_suffix(&id, IdKind::Server).unwrap();
        alloc.release(n, false).await;
        // Still reserved immediately after release.
        assert_eq!(alloc.allocate().await, "fulcrum-server-2");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(alloc.allocate().await, "fulcrum-server-1");
    }
}
