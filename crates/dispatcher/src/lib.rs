//! Outbox dispatcher process: configuration and handler wiring.

pub mod config;

use std::sync::Arc;

use loyalty_notifications::{
    EMAIL_SEND, EmailSendHandler, LogMailTransport, MailTransport, SmtpConfig, SmtpMailTransport,
    TransportError,
};
use loyalty_outbox::HandlerRegistry;

pub use config::{Config, ConfigError};

/// SMTP when configured, otherwise the log-only transport.
pub fn mail_transport(smtp: Option<SmtpConfig>) -> Result<Arc<dyn MailTransport>, TransportError> {
    match smtp {
        Some(config) => {
            tracing::info!(smtp_host = %config.host, smtp_port = config.port, "using SMTP mail transport");
            Ok(Arc::new(SmtpMailTransport::new(config)?))
        }
        None => {
            tracing::warn!("SMTP_HOST not set; emails will be logged, not sent");
            Ok(Arc::new(LogMailTransport))
        }
    }
}

/// Every handler this process knows about.
pub fn build_registry(mail: Arc<dyn MailTransport>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_typed(EMAIL_SEND, EmailSendHandler::new(mail));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_routes_email_send() {
        let registry = build_registry(mail_transport(None).unwrap());
        assert_eq!(registry.event_types(), vec![EMAIL_SEND]);
        assert!(registry.resolve("EMAIL_SEND").is_some());
    }

    #[test]
    fn smtp_transport_needs_a_valid_sender() {
        let err = mail_transport(Some(SmtpConfig::new("smtp.example.com", "nope"))).err().unwrap();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }
}
