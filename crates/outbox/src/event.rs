//! Outbox event records and their lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use loyalty_core::{ClaimToken, EventId};

/// Lifecycle status of an outbox event.
///
/// `PENDING -> PROCESSING -> {SENT | FAILED | DEAD}`. `FAILED` becomes
/// claimable again once its `next_retry_at` passes; `SENT` and `DEAD` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Waiting for its first attempt
    Pending,
    /// Claimed by a dispatcher
    Processing,
    /// Handled successfully
    Sent,
    /// Last attempt failed, will be retried
    Failed,
    /// Undeliverable, never claimed again
    Dead,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Sent,
        EventStatus::Failed,
        EventStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Sent => "SENT",
            EventStatus::Failed => "FAILED",
            EventStatus::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Dead)
    }

    /// Whether a row in this status may be picked up by a claim (subject to
    /// `next_retry_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::Failed)
    }
}

impl core::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown event status: {s}"))
    }
}

/// An event ready to be inserted (not yet persisted).
///
/// Build one with [`crate::Outbox::prepare`], which serializes the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: Option<String>,
    pub event_type: String,
    pub payload: JsonValue,
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: Option<String>,
    pub event_type: String,
    pub payload: JsonValue,
    pub status: EventStatus,
    /// Completed handling attempts. Never decreases; unchanged by claiming.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Not claimable before this instant. `None` means immediately eligible.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Token of the claim currently holding the row. Set only while
    /// `PROCESSING`.
    pub claim_token: Option<ClaimToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Whether a claim at `now` would select this row.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// Pre-transition snapshot returned by a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedEvent {
    pub id: EventId,
    /// Must accompany every renewal and acknowledgement of this claim.
    pub claim_token: ClaimToken,
    pub event_type: String,
    pub payload: JsonValue,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
}

impl ClaimedEvent {
    /// The attempt number this handling would be.
    pub fn next_attempt(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }
}

/// Outcome of a failed attempt, as written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub id: EventId,
    pub claim_token: ClaimToken,
    /// New value for `attempt_count`.
    pub attempt: u32,
    pub error: String,
    pub next_retry_at: DateTime<Utc>,
    /// `true` moves the event to `DEAD` instead of `FAILED`.
    pub dead: bool,
}

impl FailureRecord {
    pub fn status(&self) -> EventStatus {
        if self.dead {
            EventStatus::Dead
        } else {
            EventStatus::Failed
        }
    }
}
