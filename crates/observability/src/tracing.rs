//! Tracing/logging initialization.
//!
//! JSON lines by default, human-readable with `LOG_FORMAT=pretty`. Filtering
//! follows `RUST_LOG` and defaults to `info`.

use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Parse a `LOG_FORMAT` value. Unknown values mean JSON.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("pretty") || v.eq_ignore_ascii_case("text") => {
                LogFormat::Pretty
            }
            _ => LogFormat::Json,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_FORMAT").ok().as_deref())
    }
}

/// Initialize tracing for the process, format taken from `LOG_FORMAT`.
///
/// Safe to call multiple times (subsequent calls are no-ops). Returns a span
/// carrying the service name; enter it to tag everything the service logs.
pub fn init(service: &'static str) -> tracing::Span {
    init_with(service, LogFormat::from_env())
}

pub fn init_with(service: &'static str, format: LogFormat) -> tracing::Span {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
    };

    tracing::info_span!("service", service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("PRETTY")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some(" text ")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some("yaml")), LogFormat::Json);
    }

    #[test]
    fn init_is_idempotent() {
        let _first = init_with("test", LogFormat::Pretty);
        let _second = init_with("test", LogFormat::Json);
        assert!(::tracing::dispatcher::get_default(
            |d| !d.is::<::tracing::subscriber::NoSubscriber>()
        ));
    }
}
