//! Process configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use loyalty_notifications::SmtpConfig;
use loyalty_outbox::DispatcherConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub dispatcher: DispatcherConfig,
    /// `None` means emails are logged instead of sent.
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let database_max_connections = env.parse("DATABASE_MAX_CONNECTIONS")?.unwrap_or(5);
        if database_max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let mut dispatcher = DispatcherConfig::default();
        if let Some(name) = env.get("OUTBOX_DISPATCHER_NAME") {
            dispatcher = dispatcher.with_name(name);
        }
        if let Some(batch) = env.positive::<usize>("OUTBOX_BATCH_SIZE")? {
            dispatcher = dispatcher.with_batch_size(batch);
        }
        if let Some(max) = env.positive::<u32>("OUTBOX_MAX_ATTEMPTS")? {
            dispatcher = dispatcher.with_max_attempts(max);
        }
        if let Some(ms) = env.positive::<u64>("OUTBOX_POLL_INTERVAL_MS")? {
            dispatcher = dispatcher.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = env.parse::<u64>("OUTBOX_PROCESSING_TIMEOUT_SECS")? {
            // 0 disables reclaiming.
            dispatcher = dispatcher
                .with_processing_timeout((secs > 0).then(|| Duration::from_secs(secs)));
        }
        if let Some(secs) = env.positive::<u64>("OUTBOX_HANDLER_TIMEOUT_SECS")? {
            dispatcher = dispatcher.with_handler_timeout(Some(Duration::from_secs(secs)));
        }

        let smtp = match env.get("SMTP_HOST") {
            None => None,
            Some(host) => {
                let from = env.get("SMTP_FROM").ok_or(ConfigError::Missing("SMTP_FROM"))?;
                let mut smtp = SmtpConfig::new(host, from);
                if let Some(port) = env.parse::<u16>("SMTP_PORT")? {
                    smtp.port = port;
                }
                smtp.username = env.get("SMTP_USER");
                smtp.password = env.get("SMTP_PASS");
                Some(smtp)
            }
        };

        Ok(Self {
            database_url,
            database_max_connections,
            dispatcher,
            smtp,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn positive<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr + Default + PartialEq + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        match self.parse::<T>(key)? {
            Some(v) if v == T::default() => Err(ConfigError::Invalid {
                key,
                value: v.to_string(),
                reason: "must be greater than zero".into(),
            }),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let cfg = config(&[("DATABASE_URL", "postgres://localhost/luvy")]).unwrap();

        assert_eq!(cfg.database_url, "postgres://localhost/luvy");
        assert_eq!(cfg.database_max_connections, 5);
        assert_eq!(cfg.dispatcher.batch_size, 25);
        assert_eq!(cfg.dispatcher.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.dispatcher.retry.max_attempts, 8);
        assert_eq!(cfg.dispatcher.processing_timeout, Some(Duration::from_secs(300)));
        assert_eq!(cfg.dispatcher.handler_timeout, Some(Duration::from_secs(60)));
        assert!(cfg.smtp.is_none());
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(config(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
        assert_eq!(
            config(&[("DATABASE_URL", "  ")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://db/luvy"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("OUTBOX_DISPATCHER_NAME", "worker-3"),
            ("OUTBOX_BATCH_SIZE", "50"),
            ("OUTBOX_MAX_ATTEMPTS", "3"),
            ("OUTBOX_POLL_INTERVAL_MS", "500"),
            ("OUTBOX_PROCESSING_TIMEOUT_SECS", "0"),
            ("OUTBOX_HANDLER_TIMEOUT_SECS", "20"),
        ])
        .unwrap();

        assert_eq!(cfg.database_max_connections, 12);
        assert_eq!(cfg.dispatcher.name, "worker-3");
        assert_eq!(cfg.dispatcher.batch_size, 50);
        assert_eq!(cfg.dispatcher.retry.max_attempts, 3);
        assert_eq!(cfg.dispatcher.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.dispatcher.processing_timeout, None);
        assert_eq!(cfg.dispatcher.handler_timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = config(&[("DATABASE_URL", "x"), ("OUTBOX_BATCH_SIZE", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));

        let err = config(&[("DATABASE_URL", "x"), ("OUTBOX_BATCH_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));

        let err = config(&[
            ("DATABASE_URL", "x"),
            ("SMTP_HOST", "mail"),
            ("SMTP_FROM", "a@b.com"),
            ("SMTP_PORT", "70000"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SMTP_PORT", .. }));
    }

    #[test]
    fn smtp_needs_sender_when_host_is_set() {
        let err = config(&[("DATABASE_URL", "x"), ("SMTP_HOST", "smtp.example.com")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SMTP_FROM"));

        let cfg = config(&[
            ("DATABASE_URL", "x"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USER", "mailer"),
            ("SMTP_PASS", "secret"),
            ("SMTP_FROM", "Luvy <no-reply@example.com>"),
        ])
        .unwrap();
        let smtp = cfg.smtp.unwrap();
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 2525);
        assert_eq!(smtp.username.as_deref(), Some("mailer"));
        assert_eq!(smtp.password.as_deref(), Some("secret"));
    }
}
