//! Enqueue an email, run a dispatcher tick, inspect the row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use loyalty_core::{Clock, ManualClock};
use loyalty_notifications::{
    EMAIL_SEND, EmailSendHandler, EmailSendPayload, MailTransport, TransportError, enqueue_email,
};
use loyalty_outbox::{
    Dispatcher, EventStatus, HandlerRegistry, InMemoryOutboxStore, Outbox, OutboxError, OutboxStore,
};

#[derive(Debug, Clone, PartialEq)]
struct Sent {
    to: String,
    subject: String,
    html: String,
}

#[derive(Clone, Default)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<Sent>>>,
    down: Arc<AtomicBool>,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Smtp("connection refused".into()));
        }
        self.sent.lock().unwrap().push(Sent {
            to: to.to_string(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

struct Setup {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryOutboxStore>,
    outbox: Outbox<Arc<InMemoryOutboxStore>>,
    transport: RecordingTransport,
    dispatcher: Dispatcher<Arc<InMemoryOutboxStore>>,
}

fn setup() -> Setup {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
    let transport = RecordingTransport::default();

    let mut registry = HandlerRegistry::new();
    registry.register_typed(EMAIL_SEND, EmailSendHandler::new(transport.clone()));

    Setup {
        outbox: Outbox::new(store.clone()),
        dispatcher: Dispatcher::new(store.clone(), registry).with_clock(clock.clone()),
        clock,
        store,
        transport,
    }
}

fn welcome_ada() -> EmailSendPayload {
    EmailSendPayload::new("a@b.com", "WELCOME_V1").with("name", "Ada")
}

#[tokio::test]
async fn welcome_email_is_rendered_sent_and_acknowledged() {
    let s = setup();
    let id = enqueue_email(&s.outbox, &welcome_ada()).await.unwrap();

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.event_type, EMAIL_SEND);
    assert_eq!(row.aggregate_type, "notification");
    assert_eq!(
        row.payload,
        json!({"to": "a@b.com", "template": "WELCOME_V1", "data": {"name": "Ada"}})
    );

    let report = s.dispatcher.tick().await.unwrap();
    assert_eq!(report.sent, 1);

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Sent);
    assert_eq!(row.attempt_count, 1);

    let sent = s.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "a@b.com");
    assert_eq!(sent[0].subject, "Welcome to Luvy!");
    assert!(sent[0].html.contains("Hello Ada"));
}

#[tokio::test]
async fn transport_failure_leaves_event_failed_for_retry() {
    let s = setup();
    s.transport.down.store(true, Ordering::SeqCst);
    let id = enqueue_email(&s.outbox, &welcome_ada()).await.unwrap();
    let now = s.clock.now();

    let report = s.dispatcher.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Failed);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.next_retry_at, Some(now + chrono::Duration::seconds(2)));
    assert!(row.last_error.unwrap().contains("connection refused"));

    // Relay comes back; the retry goes through once due.
    s.transport.down.store(false, Ordering::SeqCst);
    s.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(s.dispatcher.tick().await.unwrap().sent, 1);

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Sent);
    assert_eq!(row.attempt_count, 2);
    assert_eq!(s.transport.sent().len(), 1);
}

#[tokio::test]
async fn unknown_template_still_sends_generic_email() {
    let s = setup();
    let payload = EmailSendPayload::new("a@b.com", "SPRING_PROMO");
    enqueue_email(&s.outbox, &payload).await.unwrap();

    assert_eq!(s.dispatcher.tick().await.unwrap().sent, 1);
    assert_eq!(s.transport.sent()[0].subject, "Luvy notification");
}

#[tokio::test]
async fn payload_without_recipient_is_retried_as_decode_failure() {
    let s = setup();
    let id = s
        .outbox
        .enqueue("notification", None, EMAIL_SEND, &json!({"template": "WELCOME_V1"}))
        .await
        .unwrap();

    assert_eq!(s.dispatcher.tick().await.unwrap().failed, 1);

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Failed);
    assert!(row.last_error.unwrap().starts_with("invalid payload"));
    assert!(s.transport.sent().is_empty());
}

#[tokio::test]
async fn enqueue_email_requires_recipient() {
    let s = setup();
    let err = enqueue_email(&s.outbox, &EmailSendPayload::new(" ", "WELCOME_V1"))
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::Invalid(_)));
    assert_eq!(s.store.stats().await.unwrap().total(), 0);
}
