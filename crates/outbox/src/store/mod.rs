//! Outbox persistence.
//!
//! The store owns every durability guarantee of the subsystem. Claiming is
//! the only concurrency-safety boundary: two concurrent `claim_batch` calls
//! must never return the same event.
//!
//! Every claim stamps its rows with a fresh [`ClaimToken`]. Renewals and
//! acknowledgements only apply while the row is `PROCESSING` under that same
//! token, so once a row has been reclaimed and claimed again, the previous
//! holder can no longer touch it.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use loyalty_core::{ClaimToken, EventId};

use crate::event::{ClaimedEvent, EventStatus, FailureRecord, NewOutboxEvent, OutboxEvent};

pub use memory::InMemoryOutboxStore;
pub use postgres::{PostgresOutboxStore, enqueue_in_tx};

/// Outbox store abstraction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new event as `PENDING` with `attempt_count = 0`.
    async fn insert(&self, event: NewOutboxEvent) -> Result<EventId, StoreError>;

    /// Atomically move up to `limit` due events to `PROCESSING`, oldest first,
    /// returning their pre-transition snapshot.
    ///
    /// Rows held by a concurrent claimer are skipped, never awaited.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEvent>, StoreError>;

    /// Refresh the lease on a held row so `reclaim_stale` leaves it alone.
    ///
    /// Fails with [`StoreError::NotClaimed`] if the claim has been lost.
    async fn renew_claim(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError>;

    /// Acknowledge a successful attempt: `PROCESSING -> SENT`, counting the
    /// attempt.
    async fn mark_sent(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError>;

    /// Record a failed attempt: `PROCESSING -> FAILED | DEAD`.
    async fn mark_failed(&self, failure: FailureRecord) -> Result<(), StoreError>;

    /// Return `PROCESSING` rows whose lease is older than `older_than` to
    /// `PENDING`, dropping their claim token. Returns the number of rows
    /// reclaimed.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Load a single event.
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError>;

    /// Dead-lettered events, most recently updated first.
    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Event counts per status.
    async fn stats(&self) -> Result<OutboxStats, StoreError>;
}

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached (transient)
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected the operation
    #[error("database error: {0}")]
    Database(String),
    /// Acknowledgement for an event this claim does not hold
    #[error("event {0} is not held by this claim")]
    NotClaimed(EventId),
    /// A persisted row could not be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Event counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead: u64,
}

impl OutboxStats {
    pub(crate) fn add(&mut self, status: EventStatus, count: u64) {
        match status {
            EventStatus::Pending => self.pending += count,
            EventStatus::Processing => self.processing += count,
            EventStatus::Sent => self.sent += count,
            EventStatus::Failed => self.failed += count,
            EventStatus::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed + self.dead
    }
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    async fn insert(&self, event: NewOutboxEvent) -> Result<EventId, StoreError> {
        (**self).insert(event).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        (**self).claim_batch(limit).await
    }

    async fn renew_claim(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError> {
        (**self).renew_claim(id, token).await
    }

    async fn mark_sent(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError> {
        (**self).mark_sent(id, token).await
    }

    async fn mark_failed(&self, failure: FailureRecord) -> Result<(), StoreError> {
        (**self).mark_failed(failure).await
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        (**self).reclaim_stale(older_than).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        (**self).get(id).await
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        (**self).list_dead(limit).await
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        (**self).stats().await
    }
}
