//! A single-purpose sliding-window limiter keyed by node id, used by the
//! heartbeat monitor (C7) to cap its "heartbeat from known node in an
//! unexpected state" warning to at most one per 5 seconds per id. The
//! fixed-reset-on-elapsed window mechanics are the same shape the room
//! rate limiter this crate started from used for its counters.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct NodeWarningLimiterConfig {
    pub max_warnings: u32,
    pub time_window: Duration,
}

impl Default for NodeWarningLimiterConfig {
    fn default() -> Self {
        Self {
            max_warnings: 1,
            time_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

impl WindowEntry {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now() }
    }

    fn maybe_reset(&mut self, config: &NodeWarningLimiterConfig) {
        if self.window_start.elapsed() >= config.time_window {
            self.count = 0;
            self.window_start = Instant::now();
        }
    }

    fn try_fire(&mut self, config: &NodeWarningLimiterConfig) -> bool {
        self.maybe_reset(config);
        if self.count < config.max_warnings {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Returns `true` at most `max_warnings` times per `time_window` per node.
pub struct NodeWarningLimiter {
    config: NodeWarningLimiterConfig,
    entries: Arc<RwLock<HashMap<String, WindowEntry>>>,
}

impl NodeWarningLimiter {
    pub fn new(config: NodeWarningLimiterConfig) -> Self {
        Self { config, entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn allow(&self, node_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(node_id.to_string()).or_insert_with(WindowEntry::new);
        entry.try_fire(&self.config)
    }

    pub async fn cleanup_stale_entries(&self) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let threshold = self.config.time_window * 2;
        entries.retain(|_, entry| now.duration_since(entry.window_start) < threshold);
    }

    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.time_window * 2);
            loop {
                ticker.tick().await;
                this.cleanup_stale_entries().await;
            }
        })
    }
}
