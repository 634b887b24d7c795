//! Forwarding of unsolicited viewer notifications.
//!
//! The viewer may print `{"name": ..., "args": [...]}` frames on its own
//! initiative (e.g. when the user highlights a trace). Anything else arriving
//! outside an exchange is chatter: it is dropped and, in verbose mode, logged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

/// Callback invoked with the event's `args`.
pub type EventHandler = Arc<dyn Fn(&[serde_json::Value]) + Send + Sync>;

/// An unsolicited notification from the viewer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewerEvent {
    pub name: String,
    pub args: Vec<serde_json::Value>,
}

impl ViewerEvent {
    /// Parse `payload` as an event. `None` for anything that is not exactly
    /// `{name: string, args: array}`.
    #[must_use]
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload.trim()).ok()
    }
}

/// Routes validated events to handlers registered by name.
pub struct EventForwarder {
    handlers: RwLock<HashMap<String, EventHandler>>,
    verbose: bool,
}

impl EventForwarder {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            verbose,
        }
    }

    /// Register `handler` for events called `name`, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&[serde_json::Value]) + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handlers.remove(name).is_some()
    }

    /// Validate `payload` and invoke the matching handler.
    ///
    /// Never fails. Returns whether a handler ran.
    pub fn try_dispatch(&self, payload: &str) -> bool {
        let Some(event) = ViewerEvent::parse(payload) else {
            if self.verbose {
                tracing::debug!(payload, "Failed to parse viewer output");
            }
            return false;
        };

        // Clone out so the handler runs without the lock held; it may register.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&event.name)
            .cloned();

        match handler {
            Some(handler) => {
                tracing::debug!(event = %event.name, "Forwarding viewer event");
                handler(&event.args);
                true
            }
            None => {
                tracing::trace!(event = %event.name, "No handler for viewer event");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("EventForwarder")
            .field("handlers", &names)
            .field("verbose", &self.verbose)
            .finish()
    }
}
