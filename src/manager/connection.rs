//! Pure connection state, reconnect policy and manager settings
//!
//! Nothing in this module performs I/O; the event loop consults it for every
//! lifecycle decision.

use crate::credentials::token::{validate_lifetime, MAX_TOKEN_LIFETIME};
use crate::credentials::CredentialError;
use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle state of a managed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no connection attempt in progress
    Disconnected,
    /// Initial connection attempt, including subscription replay
    Connecting,
    /// Session established and every subscription acknowledged
    Connected,
    /// Session lost; backing off or attempting to reconnect
    Reconnecting { attempt: u32, budget_exhausted: bool },
    /// Explicitly closed; terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt, .. } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized in both directions, 0.0 to 1.0
    pub jitter: f64,
    /// Consecutive failed attempts before the state reports exhaustion (None = never)
    pub retry_budget: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            retry_budget: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Spread `delay` by the jitter fraction; `sample` is uniform in [0, 1)
    pub fn jittered_delay(&self, delay: Duration, sample: f64) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * sample.clamp(0.0, 1.0) - 1.0);
        delay.mul_f64(factor.max(0.0)).min(self.max_delay)
    }

    /// Whether `failed_attempts` consecutive failures used up the retry budget
    pub fn is_budget_exhausted(&self, failed_attempts: u32) -> bool {
        self.retry_budget
            .map(|budget| failed_attempts >= budget)
            .unwrap_or(false)
    }
}

/// Tunables of one connection manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub token_lifetime: Duration,
    /// Fraction of the credential lifetime after which it is proactively renewed
    pub renew_at_fraction: f64,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub close_drain_timeout: Duration,
    /// Bound of each subscription's handler queue
    pub dispatch_queue_capacity: usize,
    /// Bound of the transport request queue
    pub request_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            host: "mqtt.googleapis.com".to_string(),
            port: 8883,
            keep_alive: Duration::from_secs(60),
            token_lifetime: MAX_TOKEN_LIFETIME,
            renew_at_fraction: 0.9,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            close_drain_timeout: Duration::from_secs(5),
            dispatch_queue_capacity: 64,
            request_capacity: 64,
        }
    }
}

impl ManagerSettings {
    pub fn validate(&self) -> Result<(), ManagerError> {
        validate_lifetime(self.token_lifetime)?;

        let invalid = |message: &str| Err(ManagerError::InvalidSettings(message.to_string()));

        if self.host.is_empty() {
            return invalid("host cannot be empty");
        }
        if !(self.renew_at_fraction > 0.0 && self.renew_at_fraction < 1.0) {
            return invalid("renew_at_fraction must be between 0 and 1 (exclusive)");
        }
        if self.connect_timeout.is_zero() || self.ack_timeout.is_zero() {
            return invalid("timeouts must be greater than 0");
        }
        if self.dispatch_queue_capacity == 0 || self.request_capacity == 0 {
            return invalid("queue capacities must be greater than 0");
        }

        super::health_monitor::HealthMonitor::validate_reconnect_policy(&self.reconnect)
            .map_err(ManagerError::InvalidSettings)
    }
}

/// Connection manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("{operation} on {topic} not acknowledged within {timeout:?}")]
    AckTimeout {
        operation: &'static str,
        topic: String,
        timeout: Duration,
    },

    #[error("Subscription to {topic} rejected: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Credential expired; renewal in progress")]
    CredentialExpired,

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Connection lost before acknowledgment")]
    ConnectionLost,

    #[error("Connection manager closed")]
    Closed,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ManagerError {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ManagerError::Connect(_)
                | ManagerError::ConnectTimeout(_)
                | ManagerError::AckTimeout { .. }
                | ManagerError::Subscribe { .. }
                | ManagerError::CredentialExpired
                | ManagerError::NotConnected { .. }
                | ManagerError::ConnectionLost
                | ManagerError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::default()
    }

    #[test]
    fn test_reconnect_policy_default() {
        let policy = policy();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.jitter, 0.2);
        assert_eq!(policy.retry_budget, Some(10));
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let policy = policy();

        assert_eq!(policy.calculate_backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_backoff_delay(6), Duration::from_secs(32));

        // Capped
        assert_eq!(policy.calculate_backoff_delay(7), Duration::from_secs(60));
        assert_eq!(policy.calculate_backoff_delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let policy = policy();
        let delay = Duration::from_secs(10);

        let low = policy.jittered_delay(delay, 0.0);
        assert!(low > Duration::from_millis(7_999) && low < Duration::from_millis(8_001));
        assert_eq!(policy.jittered_delay(delay, 0.5), Duration::from_secs(10));

        let no_jitter = ReconnectPolicy {
            jitter: 0.0,
            ..policy
        };
        assert_eq!(no_jitter.jittered_delay(delay, 0.99), delay);
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = policy();
        assert!(!policy.is_budget_exhausted(9));
        assert!(policy.is_budget_exhausted(10));

        let unlimited = ReconnectPolicy {
            retry_budget: None,
            ..policy
        };
        assert!(!unlimited.is_budget_exhausted(u32::MAX));
    }

    proptest! {
        #[test]
        fn jittered_delay_never_exceeds_cap(attempt in 1u32..64, sample in 0.0f64..1.0) {
            let policy = ReconnectPolicy::default();
            let delay = policy.jittered_delay(policy.calculate_backoff_delay(attempt), sample);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= policy.base_delay.mul_f64(0.79));
        }

        #[test]
        fn backoff_is_monotonic(attempt in 1u32..64) {
            let policy = ReconnectPolicy::default();
            prop_assert!(policy.calculate_backoff_delay(attempt) <= policy.calculate_backoff_delay(attempt + 1));
        }
    }

    #[test]
    fn test_settings_validation() {
        assert!(ManagerSettings::default().validate().is_ok());

        let settings = ManagerSettings {
            renew_at_fraction: 1.0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(ManagerError::InvalidSettings(_))));

        let settings = ManagerSettings {
            token_lifetime: Duration::from_secs(25 * 3600),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ManagerError::Credential(CredentialError::InvalidLifetime(_)))
        ));
    }

    #[test]
    fn test_error_classification() {
        assert!(ManagerError::CredentialExpired.is_retryable());
        assert!(ManagerError::ConnectionLost.is_retryable());
        assert!(ManagerError::AckTimeout {
            operation: "publish",
            topic: "/devices/d/events".to_string(),
            timeout: Duration::from_secs(10),
        }
        .is_retryable());
        assert!(!ManagerError::Closed.is_retryable());
        assert!(!ManagerError::Credential(CredentialError::InvalidLifetime(Duration::ZERO))
            .is_retryable());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting {
                attempt: 3,
                budget_exhausted: false
            }
            .to_string(),
            "reconnecting (attempt 3)"
        );
    }
}
