//! Observability: structured logging and span helpers
//!
//! Connection health is exposed through `ConnectionManager::health`.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
