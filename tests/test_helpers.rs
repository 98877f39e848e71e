//! Test helpers and utilities for integration tests

use chrono::{DateTime, TimeZone, Utc};
use iotlink::clock::{Clock, InstantClock};
use iotlink::credentials::{SigningAlgorithm, TokenSigner, TransportConfig};
use iotlink::manager::ReconnectPolicy;
use iotlink::testing::MockBroker;
use iotlink::{ConnectionManager, ConnectionState, DeviceIdentity, InboundMessage, ManagerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[allow(dead_code)]
pub const RSA_PRIVATE: &[u8] = include_bytes!("fixtures/rsa_private.pem");
#[allow(dead_code)]
pub const RSA_PUBLIC: &[u8] = include_bytes!("fixtures/rsa_public.pem");
#[allow(dead_code)]
pub const ROOTS: &[u8] = include_bytes!("fixtures/roots.pem");

/// Wall-clock anchor of every paused-time test
#[allow(dead_code)]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[allow(dead_code)]
pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new("test-project", "us-central1", "test-registry", "test-device").unwrap()
}

/// Default settings without jitter so backoff timing is exact
#[allow(dead_code)]
pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        reconnect: ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        },
        ..ManagerSettings::default()
    }
}

#[allow(dead_code)]
pub fn spawn_manager(broker: &MockBroker, settings: ManagerSettings) -> ConnectionManager {
    spawn_manager_with_clock(broker, settings, Arc::new(InstantClock::new(t0())))
}

#[allow(dead_code)]
pub fn spawn_manager_with_clock(
    broker: &MockBroker,
    settings: ManagerSettings,
    clock: Arc<dyn Clock>,
) -> ConnectionManager {
    ConnectionManager::spawn(
        identity(),
        TokenSigner::from_pem(RSA_PRIVATE, SigningAlgorithm::RS256).unwrap(),
        TransportConfig::build(ROOTS).unwrap(),
        settings,
        broker.connector(),
        clock,
    )
    .unwrap()
}

/// Handler forwarding every message to the returned receiver
#[allow(dead_code)]
pub fn collector() -> (
    impl Fn(InboundMessage) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<InboundMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: InboundMessage| {
        let _ = tx.send(message);
    };
    (handler, rx)
}

/// Next collected message, failing the test after a (virtual) minute
#[allow(dead_code)]
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("message should arrive")
        .expect("handler should still be registered")
}

/// Wait until the manager reports a state matching `predicate`
#[allow(dead_code)]
pub async fn wait_for_state(
    manager: &ConnectionManager,
    predicate: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut states = manager.watch_state();
    let reached = tokio::time::timeout(Duration::from_secs(3600), states.wait_for(|s| predicate(s)))
        .await
        .expect("state should be reached")
        .expect("event loop should be running")
        .clone();
    reached
}

#[allow(dead_code)]
pub fn is_reconnecting(state: &ConnectionState) -> bool {
    matches!(state, ConnectionState::Reconnecting { .. })
}

#[allow(dead_code)]
pub fn is_connected(state: &ConnectionState) -> bool {
    *state == ConnectionState::Connected
}

/// Let spawned tasks run without advancing paused time
#[allow(dead_code)]
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
