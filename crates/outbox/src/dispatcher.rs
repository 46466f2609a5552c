//! Dispatcher loop: claims due events, routes them to handlers and records
//! the outcome.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loyalty_core::{Clock, SystemClock};

use crate::event::{ClaimedEvent, FailureRecord};
use crate::handler::{HandlerError, HandlerRegistry};
use crate::retry::RetryPolicy;
use crate::store::{OutboxStore, StoreError};

/// Dispatcher configuration. Every field is overridable per instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Maximum events claimed per tick
    pub batch_size: usize,
    /// Delay between polling ticks
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// `PROCESSING` rows whose lease is older than this are returned to
    /// `PENDING` at the start of each tick. `None` disables reclaiming.
    pub processing_timeout: Option<Duration>,
    /// Upper bound on a single handler invocation. A timeout counts as an
    /// ordinary failure. Must be shorter than `processing_timeout`, since
    /// the lease is renewed only before each handler call.
    pub handler_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-dispatcher".to_string(),
            batch_size: 25,
            poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            processing_timeout: Some(Duration::from_secs(5 * 60)),
            handler_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), DispatcherError> {
        if self.batch_size == 0 {
            return Err(DispatcherError::InvalidConfig("batch_size must be > 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(DispatcherError::InvalidConfig("poll_interval must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(DispatcherError::InvalidConfig("max_attempts must be > 0".into()));
        }
        if let Some(lease) = self.processing_timeout {
            match self.handler_timeout {
                None => {
                    return Err(DispatcherError::InvalidConfig(
                        "handler_timeout is required while processing_timeout is set".into(),
                    ));
                }
                Some(limit) if limit >= lease => {
                    return Err(DispatcherError::InvalidConfig(format!(
                        "handler_timeout ({}s) must be shorter than processing_timeout ({}s)",
                        limit.as_secs_f64(),
                        lease.as_secs_f64()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Reasons the loop refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("no tracing subscriber installed; refusing to run without logging")]
    LoggingNotConfigured,
    #[error("invalid dispatcher config: {0}")]
    InvalidConfig(String),
    #[error("dispatcher task failed: {0}")]
    Join(String),
}

/// What happened to one claimed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Failed {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    Dead {
        attempt: u32,
        reason: String,
    },
    /// The attempt ran but its outcome could not be written back. The row
    /// stays `PROCESSING` until reclaimed.
    Unrecorded { error: String },
    /// The row was reclaimed and is now held by another claim. Nothing was
    /// written; the new holder owns the outcome.
    ClaimLost,
}

/// Summary of one polling tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub reclaimed: u64,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead: usize,
    pub unrecorded: usize,
    pub lost: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Dead { .. } => self.dead += 1,
            Outcome::Unrecorded { .. } => self.unrecorded += 1,
            Outcome::ClaimLost => self.lost += 1,
        }
    }
}

/// Cumulative runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub events_claimed: u64,
    pub events_sent: u64,
    pub events_failed: u64,
    pub events_dead: u64,
    pub events_unrecorded: u64,
    pub events_lost: u64,
    pub events_reclaimed: u64,
    pub claim_errors: u64,
    pub uptime_secs: u64,
}

/// Outbox dispatcher.
///
/// Polls the store, hands each claimed event to the handler registered for
/// its type, and acknowledges the outcome. Events within a batch are handled
/// sequentially; one event's failure never affects the others.
pub struct Dispatcher<S: OutboxStore> {
    store: S,
    registry: HandlerRegistry,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: OutboxStore> Dispatcher<S> {
    pub fn new(store: S, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry,
            config: DispatcherConfig::default(),
            clock: Arc::new(SystemClock),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for every `next_retry_at` computation.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Store errors never end the loop: they are logged and the next tick
    /// tries again. Cancellation is observed between ticks, so an in-progress
    /// batch always finishes.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DispatcherError> {
        if !logging_configured() {
            return Err(DispatcherError::LoggingNotConfigured);
        }
        self.config.validate()?;

        info!(
            dispatcher = %self.config.name,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.retry.max_attempts,
            handlers = ?self.registry.event_types(),
            "outbox dispatcher started"
        );
        let started = Instant::now();

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // Errors are already logged and counted.
                    let _ = self.tick().await;
                    self.update_stats(|s| s.uptime_secs = started.elapsed().as_secs());
                }
            }
        }

        info!(dispatcher = %self.config.name, "outbox dispatcher stopped");
        Ok(())
    }

    /// One polling cycle: reclaim stale rows, claim a batch, dispatch it.
    ///
    /// Only a claim failure is returned as an error; per-event failures are
    /// recorded on the events themselves.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();
        self.update_stats(|s| s.ticks += 1);

        if let Some(timeout) = self.config.processing_timeout {
            match self.store.reclaim_stale(timeout).await {
                Ok(0) => {}
                Ok(n) => {
                    warn!(
                        dispatcher = %self.config.name,
                        reclaimed = n,
                        timeout_secs = timeout.as_secs(),
                        "reclaimed stale PROCESSING events"
                    );
                    report.reclaimed = n;
                    self.update_stats(|s| s.events_reclaimed += n);
                }
                Err(e) => {
                    error!(dispatcher = %self.config.name, error = %e, "reclaim stale events failed");
                }
            }
        }

        let events = match self.store.claim_batch(self.config.batch_size).await {
            Ok(events) => events,
            Err(e) => {
                error!(dispatcher = %self.config.name, error = %e, "claim batch failed");
                self.update_stats(|s| s.claim_errors += 1);
                return Err(e);
            }
        };

        report.claimed = events.len();
        if !events.is_empty() {
            debug!(dispatcher = %self.config.name, count = events.len(), "claimed events");
        }

        for event in events {
            let outcome = self.dispatch(event).await;
            report.record(&outcome);
        }

        self.update_stats(|s| {
            s.events_claimed += report.claimed as u64;
            s.events_sent += report.sent as u64;
            s.events_failed += report.failed as u64;
            s.events_dead += report.dead as u64;
            s.events_unrecorded += report.unrecorded as u64;
            s.events_lost += report.lost as u64;
        });

        Ok(report)
    }

    /// Handle one claimed event and record its outcome.
    ///
    /// The lease is renewed first: an event claimed early in a long batch may
    /// already have been reclaimed by another dispatcher, in which case it is
    /// skipped.
    pub async fn dispatch(&self, event: ClaimedEvent) -> Outcome {
        let attempt = event.next_attempt();

        match self.store.renew_claim(event.id, event.claim_token).await {
            Ok(()) => {}
            Err(StoreError::NotClaimed(_)) => return self.claim_lost(&event, "renew"),
            Err(e) => {
                error!(event_id = %event.id, error = %e, "renew claim failed");
                return Outcome::Unrecorded {
                    error: e.to_string(),
                };
            }
        }

        let Some(handler) = self.registry.resolve(&event.event_type) else {
            // Waiting cannot make an unknown type known.
            let reason = format!("unknown event_type: {}", event.event_type);
            return self.dead_letter(&event, attempt, reason).await;
        };

        let result = match self.config.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle(&event.payload))
                .await
                .unwrap_or_else(|_| {
                    Err(HandlerError::failed(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    )))
                }),
            None => handler.handle(&event.payload).await,
        };

        match result {
            Ok(()) => self.mark_sent(&event, attempt).await,
            Err(e) if e.is_permanent() => self.dead_letter(&event, attempt, e.to_string()).await,
            Err(e) => self.fail(&event, attempt, e.to_string()).await,
        }
    }

    fn claim_lost(&self, event: &ClaimedEvent, stage: &'static str) -> Outcome {
        warn!(
            dispatcher = %self.config.name,
            event_id = %event.id,
            stage,
            "claim lost to another dispatcher"
        );
        Outcome::ClaimLost
    }

    async fn mark_sent(&self, event: &ClaimedEvent, attempt: u32) -> Outcome {
        if let Err(e) = self.store.mark_sent(event.id, event.claim_token).await {
            if matches!(e, StoreError::NotClaimed(_)) {
                return self.claim_lost(event, "mark_sent");
            }
            error!(event_id = %event.id, error = %e, "mark sent failed");
            return Outcome::Unrecorded {
                error: e.to_string(),
            };
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            attempt,
            "event sent"
        );
        Outcome::Sent
    }

    /// Record a retryable failure, dead-lettering once attempts run out.
    async fn fail(&self, event: &ClaimedEvent, attempt: u32, error_msg: String) -> Outcome {
        let id = event.id;
        let policy = &self.config.retry;
        let next_retry_at = deadline(self.clock.now(), policy.backoff(attempt));
        let dead = policy.is_exhausted(attempt);

        let record = FailureRecord {
            id,
            claim_token: event.claim_token,
            attempt,
            error: error_msg.clone(),
            next_retry_at,
            dead,
        };
        if let Err(e) = self.store.mark_failed(record).await {
            if matches!(e, StoreError::NotClaimed(_)) {
                return self.claim_lost(event, "mark_failed");
            }
            error!(event_id = %id, error = %e, "mark failed failed");
            return Outcome::Unrecorded {
                error: e.to_string(),
            };
        }

        if dead {
            error!(event_id = %id, attempt, error = %error_msg, "event dead");
            Outcome::Dead {
                attempt,
                reason: error_msg,
            }
        } else {
            warn!(
                event_id = %id,
                attempt,
                error = %error_msg,
                next_retry_at = %next_retry_at,
                "event failed"
            );
            Outcome::Failed {
                attempt,
                next_retry_at,
            }
        }
    }

    /// Dead-letter without consulting backoff. `next_retry_at` is set a
    /// cooldown ahead purely as a marker.
    async fn dead_letter(&self, event: &ClaimedEvent, attempt: u32, reason: String) -> Outcome {
        let id = event.id;
        let record = FailureRecord {
            id,
            claim_token: event.claim_token,
            attempt,
            error: reason.clone(),
            next_retry_at: deadline(self.clock.now(), self.config.retry.dead_letter_cooldown),
            dead: true,
        };
        if let Err(e) = self.store.mark_failed(record).await {
            if matches!(e, StoreError::NotClaimed(_)) {
                return self.claim_lost(event, "mark_dead");
            }
            error!(event_id = %id, error = %e, "mark dead failed");
            return Outcome::Unrecorded {
                error: e.to_string(),
            };
        }

        error!(event_id = %id, attempt, error = %reason, "event dead");
        Outcome::Dead { attempt, reason }
    }

    fn update_stats(&self, f: impl FnOnce(&mut DispatcherStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl<S: OutboxStore + 'static> Dispatcher<S> {
    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        DispatcherHandle {
            shutdown,
            join,
            stats,
        }
    }
}

/// Handle to control a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    join: JoinHandle<Result<(), DispatcherError>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub async fn shutdown(self) -> Result<(), DispatcherError> {
        self.shutdown.cancel();
        self.join
            .await
            .map_err(|e| DispatcherError::Join(e.to_string()))?
    }

    /// Token that stops the dispatcher when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// `now + delay`, clamped to a century out for absurd delays.
fn deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or_else(|| now + chrono::Duration::days(36_500))
}

/// Whether a tracing subscriber is installed for the current thread or
/// process.
fn logging_configured() -> bool {
    tracing::dispatcher::get_default(|d| !d.is::<tracing::subscriber::NoSubscriber>())
}
