//! rumqttc implementation of the broker transport
//!
//! Split the same way as the rest of the crate: pure option building and event
//! routing, with the impure session on top.
//!
//! - [`connection`] - MQTT options from a connect request
//! - [`event_router`] - rumqttc event and error classification
//! - [`session`] - connector and live session

pub mod connection;
pub mod event_router;
pub mod session;

pub use session::{RumqttConnector, RumqttSession};
