//! In-memory outbox store for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use loyalty_core::{ClaimToken, Clock, EventId, SystemClock};

use super::{OutboxStats, OutboxStore, StoreError};
use crate::event::{ClaimedEvent, EventStatus, FailureRecord, NewOutboxEvent, OutboxEvent};

/// In-memory outbox store.
///
/// One mutex guards every row, so a claim selects and transitions its batch
/// atomically and concurrent claimers can never overlap. Eligibility, leases
/// and audit timestamps all come from the injected clock.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    events: Mutex<HashMap<EventId, OutboxEvent>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while set, every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every row, oldest first.
    pub fn all(&self) -> Vec<OutboxEvent> {
        let mut all: Vec<_> = self.rows().values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.id));
        all
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<EventId, OutboxEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    /// The row, if it is `PROCESSING` under `token`.
    fn held_row<'a>(
        rows: &'a mut HashMap<EventId, OutboxEvent>,
        id: EventId,
        token: ClaimToken,
    ) -> Result<&'a mut OutboxEvent, StoreError> {
        match rows.get_mut(&id) {
            Some(row)
                if row.status == EventStatus::Processing && row.claim_token == Some(token) =>
            {
                Ok(row)
            }
            _ => Err(StoreError::NotClaimed(id)),
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, event: NewOutboxEvent) -> Result<EventId, StoreError> {
        self.check_available()?;

        let mut rows = self.rows();
        if rows.contains_key(&event.id) {
            return Err(StoreError::Database(format!(
                "duplicate key value violates unique constraint: id={}",
                event.id
            )));
        }

        let now = self.clock.now();
        let id = event.id;
        rows.insert(
            id,
            OutboxEvent {
                id,
                aggregate_type: event.aggregate_type,
                aggregate_id: event.aggregate_id,
                event_type: event.event_type,
                payload: event.payload,
                status: EventStatus::Pending,
                attempt_count: 0,
                last_error: None,
                next_retry_at: None,
                claim_token: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEvent>, StoreError> {
        self.check_available()?;

        let now = self.clock.now();
        let mut rows = self.rows();

        let mut due: Vec<_> = rows
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| (e.created_at, e.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let token = ClaimToken::new();
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(row) = rows.get_mut(&id) {
                claimed.push(ClaimedEvent {
                    id: row.id,
                    claim_token: token,
                    event_type: row.event_type.clone(),
                    payload: row.payload.clone(),
                    attempt_count: row.attempt_count,
                    created_at: row.created_at,
                });
                row.status = EventStatus::Processing;
                row.claim_token = Some(token);
                row.updated_at = now;
            }
        }

        Ok(claimed)
    }

    async fn renew_claim(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError> {
        self.check_available()?;

        let now = self.clock.now();
        let mut rows = self.rows();
        Self::held_row(&mut rows, id, token)?.updated_at = now;
        Ok(())
    }

    async fn mark_sent(&self, id: EventId, token: ClaimToken) -> Result<(), StoreError> {
        self.check_available()?;

        let now = self.clock.now();
        let mut rows = self.rows();
        let row = Self::held_row(&mut rows, id, token)?;
        row.status = EventStatus::Sent;
        row.claim_token = None;
        row.attempt_count = row.attempt_count.saturating_add(1);
        row.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, failure: FailureRecord) -> Result<(), StoreError> {
        self.check_available()?;

        let now = self.clock.now();
        let mut rows = self.rows();
        let row = Self::held_row(&mut rows, failure.id, failure.claim_token)?;
        row.status = failure.status();
        row.claim_token = None;
        row.attempt_count = row.attempt_count.max(failure.attempt);
        row.next_retry_at = Some(failure.next_retry_at);
        row.last_error = Some(failure.error);
        row.updated_at = now;
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        self.check_available()?;

        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };

        let mut reclaimed = 0;
        for row in self.rows().values_mut() {
            if row.status == EventStatus::Processing && row.updated_at < cutoff {
                row.status = EventStatus::Pending;
                row.claim_token = None;
                row.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        self.check_available()?;
        Ok(self.rows().get(&id).cloned())
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        self.check_available()?;

        let mut dead: Vec<_> = self
            .rows()
            .values()
            .filter(|e| e.status == EventStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        self.check_available()?;

        let mut stats = OutboxStats::default();
        for row in self.rows().values() {
            stats.add(row.status, 1);
        }
        Ok(stats)
    }
}
