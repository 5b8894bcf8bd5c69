//! Message handlers and their registry.
//!
//! Handlers are keyed by message name; registering a second handler for a
//! name replaces the first.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::broadcast::Broadcast;

/// Error type handlers may return. Any error ends the listening session.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What the listen loop should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    /// Keep listening.
    #[default]
    Continue,
    /// End the session now, without waiting for queued messages.
    Stop,
}

/// Handles one kind of broadcast message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a received message.
    ///
    /// `payload` is the decoded JSON payload, `None` if the message carried
    /// none. `client` is the listening client, so handlers can read the
    /// sequence, publish, or call [`Broadcast::stop`].
    async fn handle(
        &self,
        payload: Option<Value>,
        client: &Broadcast,
        name: &str,
    ) -> Result<Flow, HandlerError>;
}

/// Adapts a synchronous closure to [`MessageHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(Option<Value>, &Broadcast, &str) -> Result<Flow, HandlerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(Option<Value>, &Broadcast, &str) -> Result<Flow, HandlerError> + Send + Sync,
{
    async fn handle(
        &self,
        payload: Option<Value>,
        client: &Broadcast,
        name: &str,
    ) -> Result<Flow, HandlerError> {
        (self.0)(payload, client, name)
    }
}

/// Callback invoked with the sequence value captured when listening starts.
pub type ListenCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Mapping from message name to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(name.into(), handler)
    }

    /// Remove the handler for a name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.remove(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.handlers.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered message names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}
