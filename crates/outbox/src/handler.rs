//! Handler registry: routes an event to its side-effect executor by
//! `event_type`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The payload does not have the shape the handler expects.
    ///
    /// Retried under the normal policy like any other failure.
    #[error("invalid payload: {0}")]
    Decode(String),
    /// The side effect failed (transport error, timeout, ...). Retried.
    #[error("{0}")]
    Failed(String),
    /// The handler knows retrying cannot help. Dead-lettered immediately.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

/// Executes the side effect for one event type.
///
/// Delivery is at-least-once: implementations must tolerate being called
/// more than once for the same event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: &JsonValue) -> Result<(), HandlerError>;
}

/// A handler that works on a decoded payload type.
///
/// Wrap it in [`Typed`] (or use [`HandlerRegistry::register_typed`]) to get
/// an [`EventHandler`] that decodes first and reports decode failures as
/// [`HandlerError::Decode`].
#[async_trait]
pub trait TypedHandler: Send + Sync {
    type Payload: DeserializeOwned + Send;

    async fn execute(&self, payload: Self::Payload) -> Result<(), HandlerError>;
}

/// Decoder + handler pair.
#[derive(Debug, Clone)]
pub struct Typed<H>(pub H);

#[async_trait]
impl<H: TypedHandler> EventHandler for Typed<H> {
    async fn handle(&self, payload: &JsonValue) -> Result<(), HandlerError> {
        let decoded = <H::Payload as Deserialize>::deserialize(payload)
            .map_err(|e| HandlerError::Decode(e.to_string()))?;
        self.0.execute(decoded).await
    }
}

/// Mapping from event type to handler. Lookup is by exact match.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `event_type`.
    pub fn register<H>(&mut self, event_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    pub fn register_typed<H>(&mut self, event_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: TypedHandler + 'static,
    {
        self.register(event_type, Typed(handler))
    }

    pub fn resolve(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
