//! Pure health monitoring and reconnection logic
//!
//! This module contains pure functions for reconnect decisions, state
//! transitions and health metrics. The event loop owns all timers and I/O.

use super::connection::{ConnectionState, ReconnectPolicy};
use crate::credentials::SignedCredential;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Messages older than this mark an otherwise connected session unhealthy
const STALE_MESSAGE_THRESHOLD: Duration = Duration::from_secs(300);

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide the next reconnect attempt after `failed_attempts` consecutive failures
    ///
    /// Exhausting the retry budget is reported but never stops the loop; only
    /// an explicit close does.
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = failed_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.calculate_backoff_delay(attempt),
            budget_exhausted: policy.is_budget_exhausted(failed_attempts),
        }
    }

    /// Determine next state after a lifecycle event (pure function)
    pub fn determine_next_state(
        _current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
            ConnectionEvent::Ready => ConnectionState::Connected,
            ConnectionEvent::InitialConnectFailed => ConnectionState::Disconnected,
            ConnectionEvent::ReconnectionScheduled {
                attempt,
                budget_exhausted,
            } => ConnectionState::Reconnecting {
                attempt,
                budget_exhausted,
            },
            ConnectionEvent::CloseRequested => ConnectionState::Closed,
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
        credential_renewals: u32,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            credential_renewals,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last_msg)) => last_msg < STALE_MESSAGE_THRESHOLD,
            _ => false,
        }
    }

    /// Time from `now` until the credential should be renewed
    pub fn renewal_delay(
        credential: &SignedCredential,
        renew_at_fraction: f64,
        now: DateTime<Utc>,
    ) -> Duration {
        (credential.renewal_deadline(renew_at_fraction) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established successfully");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting { .. }) => {
                warn!("MQTT connection lost, reconnecting");
            }
            (ConnectionState::Reconnecting { attempt, .. }, ConnectionState::Connected) => {
                info!(attempt, "Reconnection successful");
            }
            (
                ConnectionState::Reconnecting {
                    budget_exhausted: false,
                    ..
                },
                ConnectionState::Reconnecting {
                    attempt,
                    budget_exhausted: true,
                },
            ) => {
                error!(attempt, "Reconnect retry budget exhausted, continuing at maximum backoff");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                warn!("Initial connection failed");
            }
            (_, ConnectionState::Closed) => {
                info!("MQTT connection closed");
            }
            _ => {
                info!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }

    /// Validate reconnect policy (pure function)
    pub fn validate_reconnect_policy(policy: &ReconnectPolicy) -> Result<(), String> {
        if policy.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }

        if policy.max_delay < policy.base_delay {
            return Err("max_delay must not be less than base_delay".to_string());
        }

        if !(0.0..=1.0).contains(&policy.jitter) {
            return Err("jitter must be between 0.0 and 1.0".to_string());
        }

        if policy.retry_budget == Some(0) {
            return Err("retry_budget must be greater than 0 or omitted for unlimited".to_string());
        }

        Ok(())
    }

    /// Assess connection quality based on metrics (pure function)
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            // No reconnections, good uptime
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,

            // Few reconnections
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,

            // Many reconnections
            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,

            _ => ConnectionQuality::Critical,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Back off for `delay` (before jitter), then attempt
    Proceed {
        attempt: u32,
        delay: Duration,
        budget_exhausted: bool,
    },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
}

/// Lifecycle events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectRequested,
    /// Session open and every replayed subscription acknowledged
    Ready,
    InitialConnectFailed,
    ReconnectionScheduled { attempt: u32, budget_exhausted: bool },
    CloseRequested,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current session became ready
    pub uptime: Option<Duration>,
    /// Time since last message received
    pub time_since_last_message: Option<Duration>,
    /// Number of sessions lost or renewed
    pub reconnect_count: u32,
    /// Number of sessions opened with a replacement credential
    pub credential_renewals: u32,
    /// Overall health status
    pub is_healthy: bool,
}

/// Connection quality assessment
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionQuality {
    /// Stable connection, recent activity
    Excellent,
    Good,
    /// Some reconnections, but working
    Fair,
    /// Frequent reconnections
    Poor,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{SigningAlgorithm, TokenSigner};
    use crate::identity::DeviceIdentity;
    use chrono::TimeZone;

    #[test]
    fn test_should_attempt_reconnection() {
        let policy = ReconnectPolicy::default();

        let decision = HealthMonitor::should_attempt_reconnection(0, &policy, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_secs(1),
                budget_exhausted: false,
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &policy, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        let decision = HealthMonitor::should_attempt_reconnection(2, &policy, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay: Duration::from_secs(4),
                budget_exhausted: false,
            }
        );

        // Budget exhausted, still proceeding at the cap
        let decision = HealthMonitor::should_attempt_reconnection(10, &policy, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 11,
                delay: Duration::from_secs(60),
                budget_exhausted: true,
            }
        );
    }

    #[test]
    fn test_determine_next_state() {
        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Disconnected,
            ConnectionEvent::ConnectRequested,
        );
        assert_eq!(state, ConnectionState::Connecting);

        let state =
            HealthMonitor::determine_next_state(&ConnectionState::Connecting, ConnectionEvent::Ready);
        assert_eq!(state, ConnectionState::Connected);

        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connected,
            ConnectionEvent::ReconnectionScheduled {
                attempt: 1,
                budget_exhausted: false,
            },
        );
        assert_eq!(
            state,
            ConnectionState::Reconnecting {
                attempt: 1,
                budget_exhausted: false
            }
        );

        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connecting,
            ConnectionEvent::InitialConnectFailed,
        );
        assert_eq!(state, ConnectionState::Disconnected);

        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connected,
            ConnectionEvent::CloseRequested,
        );
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Disconnected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting {
            attempt: 1,
            budget_exhausted: false
        }));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calculate_health_metrics() {
        let connect_time = Some(Instant::now());
        tokio::time::advance(Duration::from_secs(3600)).await;
        let last_message_time = Some(Instant::now());
        tokio::time::advance(Duration::from_secs(60)).await;

        let metrics =
            HealthMonitor::calculate_health_metrics(connect_time, last_message_time, 2, 1);

        assert_eq!(metrics.uptime, Some(Duration::from_secs(3660)));
        assert_eq!(metrics.time_since_last_message, Some(Duration::from_secs(60)));
        assert_eq!(metrics.reconnect_count, 2);
        assert_eq!(metrics.credential_renewals, 1);
        assert!(metrics.is_healthy);
    }

    #[test]
    fn test_determine_health_status() {
        let uptime = Some(Duration::from_secs(3600));
        assert!(HealthMonitor::determine_health_status(
            uptime,
            Some(Duration::from_secs(60))
        ));
        assert!(HealthMonitor::determine_health_status(uptime, None));
        assert!(!HealthMonitor::determine_health_status(
            uptime,
            Some(Duration::from_secs(400))
        ));
        assert!(!HealthMonitor::determine_health_status(None, None));
    }

    #[test]
    fn test_renewal_delay() {
        let signer = TokenSigner::from_pem(
            include_bytes!("../../tests/fixtures/rsa_private.pem"),
            SigningAlgorithm::RS256,
        )
        .unwrap();
        let identity = DeviceIdentity::new("p", "us-central1", "r", "d").unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let credential = signer
            .sign(&identity, t0, Duration::from_secs(24 * 3600))
            .unwrap();

        assert_eq!(
            HealthMonitor::renewal_delay(&credential, 0.9, t0),
            Duration::from_secs(77_760)
        );
        assert_eq!(
            HealthMonitor::renewal_delay(&credential, 0.9, t0 + chrono::Duration::hours(23)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_validate_reconnect_policy() {
        assert!(HealthMonitor::validate_reconnect_policy(&ReconnectPolicy::default()).is_ok());

        let unlimited = ReconnectPolicy {
            retry_budget: None,
            ..Default::default()
        };
        assert!(HealthMonitor::validate_reconnect_policy(&unlimited).is_ok());

        let zero_budget = ReconnectPolicy {
            retry_budget: Some(0),
            ..Default::default()
        };
        assert!(HealthMonitor::validate_reconnect_policy(&zero_budget).is_err());

        let inverted = ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(HealthMonitor::validate_reconnect_policy(&inverted).is_err());

        let wild_jitter = ReconnectPolicy {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(HealthMonitor::validate_reconnect_policy(&wild_jitter).is_err());
    }

    fn metrics(uptime: u64, reconnect_count: u32, is_healthy: bool) -> HealthMetrics {
        HealthMetrics {
            uptime: is_healthy.then(|| Duration::from_secs(uptime)),
            time_since_last_message: Some(Duration::from_secs(30)),
            reconnect_count,
            credential_renewals: 0,
            is_healthy,
        }
    }

    #[test]
    fn test_assess_connection_quality() {
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics(7200, 0, true)),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics(1800, 0, true)),
            ConnectionQuality::Good
        );
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics(1800, 2, true)),
            ConnectionQuality::Fair
        );
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics(1800, 8, true)),
            ConnectionQuality::Poor
        );
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics(0, 0, false)),
            ConnectionQuality::Critical
        );
    }
}
