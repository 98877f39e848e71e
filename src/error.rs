//! Top-level error type for the device client
//!
//! Each layer keeps its own error enum; [`DeviceError`] aggregates them for
//! the binary. [`redact_secrets`] scrubs credentials from messages before they
//! reach a log.

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::manager::ManagerError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for device client operations
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Connection error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Telemetry encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DeviceError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for device client operations
pub type DeviceResult<T> = Result<T, DeviceError>;

const MAX_MESSAGE_LEN: usize = 500;

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

// header.payload.signature, base64url segments
static JWT_SHAPED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("token pattern is valid")
});

/// Remove credentials and signed tokens from a message
pub fn redact_secrets(message: &str) -> String {
    let sanitized = SECRET_ASSIGNMENT.replace_all(message, "${1}=***");
    let mut sanitized = JWT_SHAPED
        .replace_all(&sanitized, "***REDACTED***")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}
