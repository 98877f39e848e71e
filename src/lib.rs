//! iotlink - authenticated MQTT device client
//!
//! Connects a device to a cloud IoT broker bridge over TLS pinned to a fixed
//! root bundle, authenticating with a short-lived signed token as the MQTT
//! password. The [`ConnectionManager`] keeps the session alive: it renews the
//! token before it expires, reconnects with backoff when the session drops and
//! re-establishes every subscription on each new session.
//!
//! # Quick Start
//!
//! ```no_run
//! use iotlink::credentials::{CredentialMaterial, SigningAlgorithm, TokenSigner, TransportConfig};
//! use iotlink::{ConnectionManager, DeviceIdentity, InboundMessage, ManagerSettings, QoS};
//! use iotlink::clock::SystemClock;
//! use iotlink::transport::RumqttConnector;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let material = CredentialMaterial::load("roots.pem", "rsa_private.pem")?;
//! let manager = ConnectionManager::spawn(
//!     DeviceIdentity::new("my-project", "us-central1", "my-registry", "my-device")?,
//!     TokenSigner::from_pem(&material.private_key, SigningAlgorithm::RS256)?,
//!     TransportConfig::build(&material.root_ca_bundle)?,
//!     ManagerSettings::default(),
//!     Arc::new(RumqttConnector),
//!     Arc::new(SystemClock),
//! )?;
//!
//! manager
//!     .subscribe_config(|message: InboundMessage| println!("config: {:?}", message.payload))
//!     .await?;
//! manager.connect().await?;
//! manager.publish_telemetry(r#"{"value":"ok"}"#).await?;
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod manager;
pub mod observability;
pub mod telemetry;
pub mod testing;
pub mod topics;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use error::{DeviceError, DeviceResult};
pub use identity::DeviceIdentity;
pub use manager::{
    ConnectionManager, ConnectionState, ManagerError, ManagerSettings, MessageHandler,
    SubscriptionHandle,
};
pub use transport::{InboundMessage, QoS};
