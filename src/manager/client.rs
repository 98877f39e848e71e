//! Public connection manager handle

use super::connection::{ConnectionState, ManagerError, ManagerSettings};
use super::dispatch::MessageHandler;
use super::event_loop::{lock_stats, Command, ConnectionLoop, ConnectionStats, LoopParts};
use super::health_monitor::{HealthMetrics, HealthMonitor};
use super::inflight::Reply;
use super::registry::SubscriptionHandle;
use crate::clock::Clock;
use crate::credentials::{SignedCredential, TokenSigner, TransportConfig};
use crate::identity::DeviceIdentity;
use crate::topics::is_wildcard_filter;
use crate::transport::{Connector, QoS};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, Instrument};

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Cloneable handle to one managed device connection
///
/// Every operation is forwarded to a single event loop task, so calls from
/// any number of tasks are serialized. Dropping the last handle closes the
/// connection.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    credential_rx: watch::Receiver<Option<Arc<SignedCredential>>>,
    stats: Arc<Mutex<ConnectionStats>>,
    identity: Arc<DeviceIdentity>,
}

impl ConnectionManager {
    /// Validate `settings` and start the event loop in `Disconnected` state
    ///
    /// Must be called inside a tokio runtime. Nothing touches the network
    /// until [`ConnectionManager::connect`].
    pub fn spawn(
        identity: DeviceIdentity,
        signer: TokenSigner,
        tls: TransportConfig,
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ManagerError> {
        settings.validate()?;

        let identity = Arc::new(identity);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (credential_tx, credential_rx) = watch::channel(None);
        let stats = Arc::new(Mutex::new(ConnectionStats::default()));

        info!(
            client_id = %identity.client_id(),
            host = %settings.host,
            port = settings.port,
            algorithm = %signer.algorithm(),
            "Starting connection manager"
        );

        let event_loop = ConnectionLoop::new(LoopParts {
            identity: Arc::clone(&identity),
            signer,
            tls,
            settings,
            connector,
            clock,
            commands: commands_rx,
            state_tx,
            credential_tx,
            stats: Arc::clone(&stats),
        });
        let span = crate::mqtt_span!(client_id = %identity.client_id());
        tokio::spawn(event_loop.run().instrument(span));

        Ok(Self {
            commands: commands_tx,
            state_rx,
            credential_rx,
            stats,
            identity,
        })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, ManagerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ManagerError::Closed)?;
        response.await.map_err(|_| ManagerError::Closed)?
    }

    /// Open the session and wait until every registered subscription is acknowledged
    ///
    /// Returns immediately when already connected. While reconnecting, waits
    /// for the reconnect to finish. A failed initial attempt leaves the
    /// manager `Disconnected` and is not retried internally.
    pub async fn connect(&self) -> Result<(), ManagerError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Publish to a concrete topic
    ///
    /// QoS 0 completes once handed to the transport; QoS 1 and 2 complete on
    /// the broker acknowledgment or fail with [`ManagerError::AckTimeout`].
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<(), ManagerError> {
        if topic.is_empty() || is_wildcard_filter(topic) {
            return Err(ManagerError::InvalidTopic(topic.to_string()));
        }

        let topic = topic.to_string();
        let payload = payload.into();
        self.request(|reply| Command::Publish {
            topic,
            payload,
            qos,
            reply,
        })
        .await
    }

    /// Register `handler` for `topic` and subscribe when connected
    ///
    /// While not connected the registration is kept and issued on the next
    /// (re)connect. Subscribing to an already registered topic replaces its
    /// handler and invalidates the previous handle.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionHandle, ManagerError> {
        if topic.is_empty() {
            return Err(ManagerError::InvalidTopic(topic.to_string()));
        }

        let topic = topic.to_string();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        self.request(|reply| Command::Subscribe {
            topic,
            qos,
            handler,
            reply,
        })
        .await
    }

    /// Remove a registration; handles already superseded are a no-op
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), ManagerError> {
        let handle = handle.clone();
        self.request(|reply| Command::Unsubscribe { handle, reply })
            .await
    }

    /// Drain in-flight work, disconnect and stop the event loop. Idempotent.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    pub async fn publish_telemetry(&self, payload: impl Into<Bytes>) -> Result<(), ManagerError> {
        let topic = self.identity.topics().telemetry();
        self.publish(&topic, payload, QoS::AtLeastOnce).await
    }

    pub async fn publish_telemetry_to(
        &self,
        subfolder: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), ManagerError> {
        let topic = self.identity.topics().telemetry_subfolder(subfolder);
        self.publish(&topic, payload, QoS::AtLeastOnce).await
    }

    pub async fn publish_state(&self, payload: impl Into<Bytes>) -> Result<(), ManagerError> {
        let topic = self.identity.topics().state();
        self.publish(&topic, payload, QoS::AtLeastOnce).await
    }

    /// Subscribe to the device configuration topic at QoS 1
    pub async fn subscribe_config(
        &self,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionHandle, ManagerError> {
        let topic = self.identity.topics().config();
        self.subscribe(&topic, QoS::AtLeastOnce, handler).await
    }

    /// Subscribe to every command subfolder at QoS 0
    pub async fn subscribe_commands(
        &self,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionHandle, ManagerError> {
        let topic = self.identity.topics().commands();
        self.subscribe(&topic, QoS::AtMostOnce, handler).await
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Credential of the current or most recent session
    pub fn current_credential(&self) -> Option<Arc<SignedCredential>> {
        self.credential_rx.borrow().clone()
    }

    pub fn health(&self) -> HealthMetrics {
        let stats = lock_stats(&self.stats);
        HealthMonitor::calculate_health_metrics(
            stats.connect_time,
            stats.last_message_time,
            stats.reconnect_count,
            stats.credential_renewals,
        )
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.identity.client_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
