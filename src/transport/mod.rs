//! Broker transport seam
//!
//! The connection manager talks to the broker only through [`Connector`] and
//! [`BrokerSession`]. The production implementation wraps rumqttc
//! ([`mqtt::RumqttConnector`]); tests drive the manager with the scripted broker
//! in `testing::mocks`.
//!
//! Requests are enqueued synchronously and report their outcome later as
//! [`SessionEvent`]s, so the manager's event loop never waits on its own queue.

use crate::credentials::TransportConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

pub use mqtt::RumqttConnector;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Whether the broker acknowledges delivery
    pub fn is_acknowledged(self) -> bool {
        !matches!(self, QoS::AtMostOnce)
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything needed to open one authenticated session
#[derive(Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub tls: TransportConfig,
    /// Bound of the client-side request queue
    pub request_capacity: usize,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***REDACTED***")
            .field("keep_alive", &self.keep_alive)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Kind of acknowledged request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Broker verdict for an acknowledged request
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Accepted,
    Rejected(String),
}

/// Event surfaced by a live session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Inbound publish on a subscribed topic
    Message(InboundMessage),
    /// A queued request was written; `packet_id` 0 means no acknowledgment follows
    Sent { kind: RequestKind, packet_id: u16 },
    /// Broker acknowledgment for a previously sent request
    Acknowledged {
        kind: RequestKind,
        packet_id: u16,
        outcome: AckOutcome,
    },
    /// Broker closed the session
    Disconnected(String),
    /// Housekeeping traffic (pings, connack on an open session)
    Idle,
}

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Broker refused connection: {code}")]
    Rejected { code: String },

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Request queue full")]
    Backpressure,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the broker refused the credential itself
    pub fn is_auth_failure(&self) -> bool {
        match self {
            TransportError::Rejected { code } => {
                code.contains("BadUserNamePassword") || code.contains("NotAuthorized")
            }
            _ => false,
        }
    }
}

/// Opens authenticated broker sessions
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a session; resolves once the broker accepted the connection
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn BrokerSession>, TransportError>;
}

/// One live broker session
#[async_trait::async_trait]
pub trait BrokerSession: Send {
    /// Enqueue a publish without waiting
    fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), TransportError>;

    /// Enqueue a subscribe without waiting
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Enqueue an unsubscribe without waiting
    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Drive the session until the next event; cancel safe
    async fn next_event(&mut self) -> Result<SessionEvent, TransportError>;

    /// Send a graceful disconnect and release the session
    async fn shutdown(&mut self);
}
