//! `EMAIL_SEND` handler and producer helper.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use loyalty_outbox::{EventId, HandlerError, Outbox, OutboxError, OutboxStore, TypedHandler};

use crate::templates::{EmailTemplate, render};
use crate::transport::MailTransport;

/// Event type for email notifications.
pub const EMAIL_SEND: &str = "EMAIL_SEND";

/// Aggregate type recorded for notification events.
pub const NOTIFICATION_AGGREGATE: &str = "notification";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSendPayload {
    pub to: String,
    pub template: EmailTemplate,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl EmailSendPayload {
    pub fn new(to: impl Into<String>, template: impl Into<EmailTemplate>) -> Self {
        Self {
            to: to.into(),
            template: template.into(),
            data: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Renders the template and sends it through the injected transport.
///
/// Transport failures are reported as ordinary (retryable) failures.
#[derive(Debug, Clone)]
pub struct EmailSendHandler<T> {
    transport: T,
}

impl<T: MailTransport> EmailSendHandler<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: MailTransport> TypedHandler for EmailSendHandler<T> {
    type Payload = EmailSendPayload;

    async fn execute(&self, payload: EmailSendPayload) -> Result<(), HandlerError> {
        let email = render(&payload.template, &payload.data);

        self.transport
            .send_html(&payload.to, &email.subject, &email.html)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        info!(template = %payload.template, "email sent");
        Ok(())
    }
}

/// Enqueue an `EMAIL_SEND` event.
///
/// `to` and `template` are required.
pub async fn enqueue_email<S: OutboxStore>(
    outbox: &Outbox<S>,
    payload: &EmailSendPayload,
) -> Result<EventId, OutboxError> {
    if payload.to.trim().is_empty() {
        return Err(OutboxError::Invalid("email recipient is empty".into()));
    }
    if payload.template.as_str().trim().is_empty() {
        return Err(OutboxError::Invalid("email template is empty".into()));
    }

    outbox
        .enqueue(NOTIFICATION_AGGREGATE, None, EMAIL_SEND, payload)
        .await
}
