//! Transactional outbox: durable, at-least-once delivery of side effects.
//!
//! ## Design
//!
//! - Business code appends events through [`Outbox`], ideally inside the same
//!   transaction as its domain writes
//! - One or more [`Dispatcher`]s poll the [`OutboxStore`], claiming batches
//!   with skip-locked semantics so no event is processed by two dispatchers
//!   at once
//! - Each event is routed to a handler by `event_type` via [`HandlerRegistry`]
//! - Failures are retried with capped exponential backoff ([`RetryPolicy`]);
//!   exhausted or unroutable events are dead-lettered
//!
//! Delivery is at-least-once: handlers must tolerate duplicates.

pub mod dispatcher;
pub mod event;
pub mod handler;
pub mod producer;
pub mod retry;
pub mod store;

pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherError, DispatcherHandle, DispatcherStats, Outcome,
    TickReport,
};
pub use event::{ClaimedEvent, EventStatus, FailureRecord, NewOutboxEvent, OutboxEvent};
pub use handler::{EventHandler, HandlerError, HandlerRegistry, Typed, TypedHandler};
pub use producer::{Outbox, OutboxError};
pub use retry::{RetryPolicy, compute_backoff};
pub use store::{InMemoryOutboxStore, OutboxStats, OutboxStore, PostgresOutboxStore, StoreError};

pub use loyalty_core::{ClaimToken, EventId};
