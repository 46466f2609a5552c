//! Mail transport capability.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to build message: {0}")]
    Message(String),
    #[error("smtp: {0}")]
    Smtp(String),
}

/// Sends an HTML email. Every error is treated as transient by the caller.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: MailTransport + ?Sized> MailTransport for Arc<T> {
    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), TransportError> {
        (**self).send_html(to, subject, html).await
    }
}

/// SMTP relay settings.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub timeout: Option<Duration>,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 587,
            username: None,
            password: None,
            from: from.into(),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// SMTP over STARTTLS, backed by `lettre`.
#[derive(Clone)]
pub struct SmtpMailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl SmtpMailTransport {
    pub fn new(config: SmtpConfig) -> Result<Self, TransportError> {
        let from = parse_mailbox(&config.from)?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| TransportError::Smtp(e.to_string()))?
            .port(config.port)
            .timeout(config.timeout);
        if let Some(username) = config.username {
            builder = builder.credentials(Credentials::new(
                username,
                config.password.unwrap_or_default(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            host: config.host,
        })
    }
}

impl fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailTransport")
            .field("host", &self.host)
            .field("from", &self.from.to_string())
            .finish()
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    #[instrument(skip(self, html), fields(smtp_host = %self.host), err)]
    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), TransportError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| TransportError::Message(e.to_string()))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| TransportError::Smtp(e.to_string()))?;
        Ok(())
    }
}

/// Logs instead of sending. For local development.
#[derive(Debug, Clone, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send_html(&self, to: &str, subject: &str, html: &str) -> Result<(), TransportError> {
        info!(to, subject, body_len = html.len(), "email (log transport, not sent)");
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_from_address() {
        let err = SmtpMailTransport::new(SmtpConfig::new("smtp.example.com", "not an address"))
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn log_transport_always_succeeds() {
        LogMailTransport
            .send_html("a@b.com", "hi", "<p>hi</p>")
            .await
            .unwrap();
    }

    #[test]
    fn config_debug_hides_password() {
        let mut config = SmtpConfig::new("smtp.example.com", "Luvy <no-reply@example.com>");
        config.password = Some("hunter2".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
