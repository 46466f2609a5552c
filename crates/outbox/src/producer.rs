//! Producer side: how business code appends events.

use serde::Serialize;
use tracing::debug;

use loyalty_core::EventId;

use crate::event::NewOutboxEvent;
use crate::store::{OutboxStore, StoreError};

/// Enqueue failure. The only failure a producer ever sees; delivery problems
/// after the insert are invisible to the caller.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid event: {0}")]
    Invalid(String),
}

/// Producer handle over an outbox store.
///
/// `enqueue` makes no network calls beyond the insert itself.
#[derive(Debug, Clone)]
pub struct Outbox<S> {
    store: S,
}

impl<S> Outbox<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Serialize `payload` and build the row without persisting it.
    ///
    /// Use with [`crate::store::enqueue_in_tx`] to insert inside a business
    /// transaction.
    pub fn prepare<T: Serialize + ?Sized>(
        aggregate_type: &str,
        aggregate_id: Option<&str>,
        event_type: &str,
        payload: &T,
    ) -> Result<NewOutboxEvent, OutboxError> {
        if aggregate_type.trim().is_empty() {
            return Err(OutboxError::Invalid("aggregate_type is empty".into()));
        }
        if event_type.trim().is_empty() {
            return Err(OutboxError::Invalid("event_type is empty".into()));
        }

        Ok(NewOutboxEvent {
            id: EventId::new(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.map(str::to_string),
            event_type: event_type.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

impl<S: OutboxStore> Outbox<S> {
    /// Append an event as `PENDING`, immediately eligible for dispatch.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        aggregate_type: &str,
        aggregate_id: Option<&str>,
        event_type: &str,
        payload: &T,
    ) -> Result<EventId, OutboxError> {
        let event = Self::prepare(aggregate_type, aggregate_id, event_type, payload)?;
        let id = self.store.insert(event).await?;
        debug!(event_id = %id, aggregate_type, event_type, "event enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;
    use crate::store::InMemoryOutboxStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn enqueue_inserts_pending_row() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let outbox = Outbox::new(store.clone());

        let id = outbox
            .enqueue(
                "notification",
                Some("user-42"),
                "EMAIL_SEND",
                &serde_json::json!({"to": "a@b.com"}),
            )
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Pending);
        assert_eq!(row.attempt_count, 0);
        assert_eq!(row.aggregate_id.as_deref(), Some("user-42"));
        assert_eq!(row.payload["to"], "a@b.com");
        assert!(row.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn unserializable_payload_is_rejected_before_insert() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let outbox = Outbox::new(store.clone());

        // JSON object keys must be strings.
        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], "x");

        let err = outbox
            .enqueue("notification", None, "EMAIL_SEND", &bad)
            .await
            .unwrap_err();

        assert!(matches!(err, OutboxError::Serialization(_)));
        assert_eq!(store.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_store_error() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.set_unavailable(true);
        let outbox = Outbox::new(store);

        let err = outbox
            .enqueue("notification", None, "EMAIL_SEND", &serde_json::json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, OutboxError::Store(StoreError::Unavailable(_))));
    }

    #[test]
    fn prepare_rejects_blank_tags() {
        assert!(matches!(
            Outbox::<()>::prepare(" ", None, "EMAIL_SEND", &()),
            Err(OutboxError::Invalid(_))
        ));
        assert!(matches!(
            Outbox::<()>::prepare("notification", None, "", &()),
            Err(OutboxError::Invalid(_))
        ));
    }
}
