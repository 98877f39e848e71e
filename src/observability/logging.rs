//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The `LOG_FORMAT` environment variable selects the output format:
//!
//! - `json` - Structured JSON for production and log aggregation
//! - `pretty` - Human-readable with colors and indentation
//! - `compact` - Terminal-friendly, colors with minimal spacing
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty, compact - defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: overrides filtering entirely (env_logger syntax)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG iotlink run
//! ```
//!
//! Tokens and private keys are never logged; credential events carry only
//! issue and expiry timestamps.

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    // rumqttc logs every ping and reconnect internally
    let mut filter = EnvFilter::new(level.to_string());
    for directive in ["rumqttc=warn", "rustls=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Install the global subscriber
///
/// Returns false when a subscriber was already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) -> bool {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let installed = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    installed.is_ok()
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() -> bool {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans)
}

/// Span around one device connection's event loop
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_connection", $($field)*)
    };
}

/// Span around a process lifecycle phase (startup, run, shutdown)
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {lifecycle_span, mqtt_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
    }

    #[test]
    fn test_log_format_parse_invalid_defaults_to_json() {
        assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Json);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("ERROR", Level::ERROR),
            ("warn", Level::WARN),
            ("Info", Level::INFO),
            ("debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("verbose", Level::INFO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "Failed for input: {input}");
        }
    }

    #[test]
    fn test_second_init_is_refused() {
        init_logging(Level::DEBUG, LogFormat::Compact, false);
        assert!(!init_logging(Level::INFO, LogFormat::Json, true));
    }

    #[test]
    fn test_spans_build() {
        let span = mqtt_span!(client_id = "projects/p/locations/r/registries/reg/devices/d");
        let _entered = span.enter();
        let _lifecycle = lifecycle_span!(phase = "startup");
    }
}
