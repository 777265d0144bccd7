//! Pattern → handler registry shared by every transport.
//!
//! Handlers are keyed by the canonical form of their [`Pattern`]. A second
//! registration under the same key replaces the first (last write wins)
//! but keeps the original registration position, which matters for
//! wildcard priority.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tracing::debug;

use crate::errors::HandlerError;
use crate::handler::{MessageHandler, into_stream};
use crate::packet::Pattern;

/// A handler together with how it was declared.
pub struct RegisteredHandler<P, C> {
    /// The handler.
    pub handler: Arc<dyn MessageHandler<P, C>>,
    /// Declared as an event handler rather than a request handler.
    pub is_event: bool,
}

impl<P, C> Clone for RegisteredHandler<P, C> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            is_event: self.is_event,
        }
    }
}

impl<P, C> std::fmt::Debug for RegisteredHandler<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("is_event", &self.is_event)
            .finish_non_exhaustive()
    }
}

/// Result of dispatching a fire-and-forget event.
#[derive(Debug)]
pub enum EventOutcome {
    /// No handler is registered for the pattern.
    NoHandler,
    /// The handler ran and its sequence was fully drained.
    Completed {
        /// Number of values the handler produced (and that were discarded).
        discarded: usize,
    },
    /// The handler failed; nobody is waiting for the error.
    Failed(HandlerError),
}

struct Registry<P, C> {
    handlers: HashMap<String, RegisteredHandler<P, C>>,
    order: Vec<String>,
}

/// Registry mapping canonical patterns to handlers.
pub struct Dispatcher<P, C> {
    registry: RwLock<Registry<P, C>>,
}

impl<P, C> Dispatcher<P, C> {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry {
                handlers: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Register `handler` under `pattern`. Returns the canonical key.
    pub fn add_handler(
        &self,
        pattern: impl Into<Pattern>,
        handler: Arc<dyn MessageHandler<P, C>>,
        is_event: bool,
    ) -> String {
        let route = pattern.into().route();
        let mut registry = self.registry.write();
        let replaced = registry
            .handlers
            .insert(route.clone(), RegisteredHandler { handler, is_event });
        if replaced.is_none() {
            registry.order.push(route.clone());
        } else {
            debug!(pattern = %route, "handler replaced");
        }
        route
    }

    /// Exact-match lookup by canonical key.
    pub fn get_handler(&self, route: &str) -> Option<RegisteredHandler<P, C>> {
        self.registry.read().handlers.get(route).cloned()
    }

    /// Whether a handler exists for the canonical key.
    pub fn has_handler(&self, route: &str) -> bool {
        self.registry.read().handlers.contains_key(route)
    }

    /// Whether the handler for `route` was declared as an event handler.
    pub fn is_event(&self, route: &str) -> Option<bool> {
        self.registry.read().handlers.get(route).map(|h| h.is_event)
    }

    /// Registered canonical keys, in registration order.
    pub fn patterns(&self) -> Vec<String> {
        self.registry.read().order.clone()
    }

    /// Registered handlers, in registration order.
    pub fn entries(&self) -> Vec<(String, RegisteredHandler<P, C>)> {
        let registry = self.registry.read();
        registry
            .order
            .iter()
            .filter_map(|route| {
                registry
                    .handlers
                    .get(route)
                    .map(|h| (route.clone(), h.clone()))
            })
            .collect()
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.registry.read().order.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Send + 'static, C: Send + 'static> Dispatcher<P, C> {
    /// Resolve `route` exactly and run it as an event.
    pub async fn handle_event(&self, route: &str, payload: P, ctx: C) -> EventOutcome {
        let entry = self.get_handler(route);
        Self::run_event(route, entry, payload, ctx).await
    }

    /// Run an already-resolved handler as an event, draining and discarding
    /// whatever it produces.
    pub async fn run_event(
        route: &str,
        entry: Option<RegisteredHandler<P, C>>,
        payload: P,
        ctx: C,
    ) -> EventOutcome {
        let Some(entry) = entry else {
            return EventOutcome::NoHandler;
        };
        if !entry.is_event {
            debug!(pattern = %route, "request handler invoked as event");
        }
        let mut stream = into_stream(entry.handler.handle(payload, ctx).await);
        let mut discarded = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => discarded += 1,
                Err(err) => return EventOutcome::Failed(err),
            }
        }
        EventOutcome::Completed { discarded }
    }
}

impl<P, C> Default for Dispatcher<P, C> {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Reply, handler_fn};
    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    type TestDispatcher = Dispatcher<Value, ()>;

    fn constant(value: Value) -> Arc<dyn MessageHandler<Value, ()>> {
        handler_fn(move |_: Value, (): ()| {
            let value = value.clone();
            async move { Ok(Reply::Value(value)) }
        })
    }

    #[test]
    fn register_and_lookup() {
        let dispatcher = TestDispatcher::new();
        let route = dispatcher.add_handler("sum", constant(json!(1)), false);
        assert_eq!(route, "sum");
        assert!(dispatcher.has_handler("sum"));
        assert!(dispatcher.get_handler("sum").is_some());
        assert!(dispatcher.get_handler("missing").is_none());
        assert_eq!(dispatcher.is_event("sum"), Some(false));
    }

    #[test]
    fn structured_patterns_use_canonical_key() {
        let dispatcher = TestDispatcher::new();
        let _ = dispatcher.add_handler(json!({"cmd": "sum", "v": 2}), constant(json!(1)), false);
        assert!(dispatcher.has_handler(r#"{"cmd":"sum","v":2}"#));
    }

    #[tokio::test]
    async fn last_registration_wins_and_keeps_position() {
        let dispatcher = TestDispatcher::new();
        let _ = dispatcher.add_handler("a", constant(json!("first")), false);
        let _ = dispatcher.add_handler("b", constant(json!("b")), true);
        let _ = dispatcher.add_handler("a", constant(json!("second")), true);

        assert_eq!(dispatcher.patterns(), vec!["a", "b"]);
        assert_eq!(dispatcher.len(), 2);

        let entry = dispatcher.get_handler("a").unwrap();
        assert!(entry.is_event);
        let reply = entry.handler.handle(Value::Null, ()).await.unwrap();
        assert_matches!(reply, Reply::Value(v) if v == json!("second"));
    }

    #[test]
    fn entries_follow_registration_order() {
        let dispatcher = TestDispatcher::new();
        for name in ["z", "a", "m"] {
            let _ = dispatcher.add_handler(name, constant(json!(name)), false);
        }
        let names: Vec<String> = dispatcher.entries().into_iter().map(|(r, _)| r).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[tokio::test]
    async fn event_without_handler_is_noop() {
        let dispatcher = TestDispatcher::default();
        assert!(dispatcher.is_empty());
        let outcome = dispatcher.handle_event("nobody", json!(1), ()).await;
        assert_matches!(outcome, EventOutcome::NoHandler);
    }

    #[tokio::test]
    async fn event_drains_entire_sequence() {
        let dispatcher = TestDispatcher::new();
        let handler = handler_fn(|_: Value, (): ()| async {
            Ok(Reply::values((0..5).map(|n| json!(n))))
        });
        let _ = dispatcher.add_handler("tick", handler, true);

        let outcome = dispatcher.handle_event("tick", Value::Null, ()).await;
        assert_matches!(outcome, EventOutcome::Completed { discarded: 5 });
    }

    #[tokio::test]
    async fn event_error_is_returned_not_raised() {
        let dispatcher = TestDispatcher::new();
        let handler = handler_fn(|_: Value, (): ()| async { Err(HandlerError::rpc("nope")) });
        let _ = dispatcher.add_handler("fail", handler, true);

        let outcome = dispatcher.handle_event("fail", Value::Null, ()).await;
        assert_matches!(outcome, EventOutcome::Failed(HandlerError::Rpc(v)) if v == json!("nope"));
    }
}
