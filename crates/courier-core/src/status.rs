//! Connection-status publisher.
//!
//! Holds the current state plus a list of change listeners. Listeners run
//! synchronously on every transition, and a newly registered listener is
//! immediately told the latest state. Publishing the state already held is
//! not a transition, so listeners see each state change exactly once.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a transport's underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Attempting to connect or bind.
    Connecting,
    /// Listening or connected.
    Connected,
    /// Not connected; may be retrying.
    Disconnected,
}

/// Handle returned by [`StatusPublisher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<S> = Arc<dyn Fn(S) + Send + Sync>;

struct Inner<S> {
    current: Option<S>,
    next_id: u64,
    listeners: Vec<(SubscriptionId, Listener<S>)>,
}

/// Broadcasts state transitions to registered listeners.
///
/// Repeated identical states are collapsed: [`set`](Self::set) with the
/// current state notifies nobody and returns `false`.
pub struct StatusPublisher<S = ConnectionStatus> {
    inner: Mutex<Inner<S>>,
}

impl<S: Copy + PartialEq> StatusPublisher<S> {
    /// Publisher with no state yet.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: None,
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }

    /// Publisher starting in `initial`.
    pub fn with_state(initial: S) -> Self {
        let publisher = Self::new();
        publisher.inner.lock().current = Some(initial);
        publisher
    }

    /// Latest state, if any was published.
    pub fn current(&self) -> Option<S> {
        self.inner.lock().current
    }

    /// Register a listener. It is called right away with the latest state
    /// (if any), then on every transition.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(S) + Send + Sync + 'static,
    {
        let listener: Listener<S> = Arc::new(listener);
        let (id, current) = {
            let mut inner = self.inner.lock();
            let id = SubscriptionId(inner.next_id);
            inner.next_id += 1;
            inner.listeners.push((id, Arc::clone(&listener)));
            (id, inner.current)
        };
        if let Some(state) = current {
            listener(state);
        }
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _)| *existing != id);
        inner.listeners.len() != before
    }

    /// Publish `state`. Listeners are notified only when it differs from
    /// the current state. Returns whether a transition happened.
    pub fn set(&self, state: S) -> bool {
        let listeners: Vec<Listener<S>> = {
            let mut inner = self.inner.lock();
            if inner.current == Some(state) {
                return false;
            }
            inner.current = Some(state);
            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(state);
        }
        true
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.inner.lock().listeners.clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl<S: Copy + PartialEq> Default for StatusPublisher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for StatusPublisher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StatusPublisher")
            .field("current", &inner.current)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
