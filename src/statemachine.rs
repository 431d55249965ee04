//! Registration state machine (C3): one instance per proxy/server node.
//! Transitions are synchronous under a per-node mutex; listener dispatch
//! happens afterwards on the shared worker pool so a slow or failing
//! listener can never block a transition.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::protocol::RegistrationState;

const MAX_HISTORY: usize = 32;

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: RegistrationState,
    pub to: RegistrationState,
    pub reason: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

fn legal(from: RegistrationState, to: RegistrationState) -> bool {
    use RegistrationState::*;
    matches!(
        (from, to),
        (Unregistered, Registering)
            | (Registering, Registered)
            | (Registering, Unregistered)
            | (Registered, Deregistering)
            | (Registered, Disconnected)
            | (Disconnected, ReRegistering)
            | (Disconnected, Unregistered)
            | (ReRegistering, Registered)
            | (ReRegistering, Unregistered)
            | (Deregistering, Disconnected)
            | (Deregistering, Unregistered)
    )
}

struct Inner {
    state: RegistrationState,
    history: Vec<TransitionRecord>,
}

/// A listener observing a single node's state machine. Dispatched
/// asynchronously after a transition commits; failures are isolated.
#[async_trait::async_trait]
pub trait StateListener: Send + Sync {
    async fn on_transition(&self, node_id: &str, record: TransitionRecord);
}

pub struct StateMachine {
    node_id: String,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
}

impl StateMachine {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            inner: Mutex::new(Inner {
                state: RegistrationState::Unregistered,
                history: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub async fn current(&self) -> RegistrationState {
        self.inner.lock().await.state
    }

    pub async fn history(&self) -> Vec<TransitionRecord> {
        self.inner.lock().await.history.clone()
    }

    /// Attempts `to`, returning `false` and leaving state unchanged for an
    /// illegal edge.
    pub async fn transition(self: &Arc<Self>, to: RegistrationState, reason: impl Into<String>) -> bool {
        let record = {
            let mut inner = self.inner.lock().await;
            if !legal(inner.state, to) {
                warn!(node_id = %self.node_id, from = %inner.state, to = %to, "rejected illegal state transition");
                return false;
            }
            let record = TransitionRecord {
                from: inner.state,
                to,
                reason: reason.into(),
                at: chrono::Utc::now(),
            };
            inner.state = to;
            inner.history.insert(0, record.clone());
            inner.history.truncate(MAX_HISTORY);
            record
        };

        let this = Arc::clone(self);
        let record_for_task = record.clone();
        tokio::spawn(async move {
            let listeners = this.listeners.lock().await.clone();
            for listener in listeners {
                listener.on_transition(&this.node_id, record_for_task.clone()).await;
            }
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl StateListener for CountingListener {
        async fn on_transition(&self, _node_id: &str, _record: TransitionRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn legal_transitions_succeed_and_record_history() {
        let sm = Arc::new(StateMachine::new("fulcrum-proxy-1"));
        assert!(sm.transition(RegistrationState::Registering, "registering").await);
        assert!(sm.transition(RegistrationState::Registered, "ack").await);
        assert_eq!(sm.current().await, RegistrationState::Registered);
        assert_eq!(sm.history().await.len(), 2);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_state_unchanged() {
        let sm = Arc::new(StateMachine::new("fulcrum-proxy-1"));
        assert!(!sm.transition(RegistrationState::Registered, "skip registering").await);
        assert_eq!(sm.current().await, RegistrationState::Unregistered);
    }

    #[tokio::test]
    async fn unregistered_is_terminal_from_disconnected() {
        let sm = Arc::new(StateMachine::new("fulcrum-server-1"));
        sm.transition(RegistrationState::Registering, "r").await;
        sm.transition(RegistrationState::Registered, "r").await;
        sm.transition(RegistrationState::Disconnected, "lost").await;
        assert!(sm.transition(RegistrationState::Unregistered, "cleanup").await);
        assert!(!sm.transition(RegistrationState::ReRegistering, "too late").await);
    }

    #[tokio::test]
    async fn listener_is_notified_without_blocking_transition() {
        let count = Arc::new(AtomicUsize::new(0));
        let sm = Arc::new(StateMachine::new("fulcrum-proxy-2"));
        sm.register_listener(Arc::new(CountingListener(Arc::clone(&count)))).await;
        sm.transition(RegistrationState::Registering, "go").await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
