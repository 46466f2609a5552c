//! Email template catalog.
//!
//! Rendering never fails: unknown templates fall back to a generic
//! notification and missing fields fall back to defaults.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Template identifier as carried in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EmailTemplate {
    WelcomeV1,
    PointsEarnedV1,
    /// Any identifier not in the catalog. Rendered with the fallback.
    Other(String),
}

impl EmailTemplate {
    pub fn as_str(&self) -> &str {
        match self {
            EmailTemplate::WelcomeV1 => "WELCOME_V1",
            EmailTemplate::PointsEarnedV1 => "POINTS_EARNED_V1",
            EmailTemplate::Other(name) => name,
        }
    }
}

impl From<&str> for EmailTemplate {
    fn from(value: &str) -> Self {
        match value {
            "WELCOME_V1" => EmailTemplate::WelcomeV1,
            "POINTS_EARNED_V1" => EmailTemplate::PointsEarnedV1,
            other => EmailTemplate::Other(other.to_string()),
        }
    }
}

impl From<String> for EmailTemplate {
    fn from(value: String) -> Self {
        match value.as_str() {
            "WELCOME_V1" | "POINTS_EARNED_V1" => EmailTemplate::from(value.as_str()),
            _ => EmailTemplate::Other(value),
        }
    }
}

impl From<EmailTemplate> for String {
    fn from(value: EmailTemplate) -> Self {
        match value {
            EmailTemplate::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EmailTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Render subject and HTML body for `template`.
pub fn render(template: &EmailTemplate, data: &HashMap<String, String>) -> RenderedEmail {
    match template {
        EmailTemplate::WelcomeV1 => {
            let name = field(data, "name").unwrap_or("there");
            RenderedEmail {
                subject: "Welcome to Luvy!".to_string(),
                html: format!(
                    "<h2>Hello {}</h2><p>Your Luvy account is active.</p>",
                    escape_html(name)
                ),
            }
        }
        EmailTemplate::PointsEarnedV1 => {
            let amount = field(data, "amount").unwrap_or("0");
            RenderedEmail {
                subject: "You earned new points!".to_string(),
                html: format!(
                    "<h2>Congratulations</h2><p>You earned +{} points.</p>",
                    escape_html(amount)
                ),
            }
        }
        EmailTemplate::Other(_) => RenderedEmail {
            subject: "Luvy notification".to_string(),
            html: "<p>You have a new notification.</p>".to_string(),
        },
    }
}

/// Non-empty value for `key`.
fn field<'a>(data: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    data.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
