//! Shared primitives for the outbox subsystem.
//!
//! Identifiers and injected capabilities only; no storage or IO.

pub mod clock;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::{ClaimToken, EventId, InvalidId};
