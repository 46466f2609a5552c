//! Email notifications delivered through the outbox.
//!
//! Producers enqueue an [`EmailSendPayload`] under [`EMAIL_SEND`]; the
//! dispatcher hands it to [`EmailSendHandler`], which renders the template
//! and sends it through a [`MailTransport`].

pub mod handler;
pub mod templates;
pub mod transport;

pub use handler::{EMAIL_SEND, EmailSendHandler, EmailSendPayload, NOTIFICATION_AGGREGATE, enqueue_email};
pub use templates::{EmailTemplate, RenderedEmail, render};
pub use transport::{LogMailTransport, MailTransport, SmtpConfig, SmtpMailTransport, TransportError};
