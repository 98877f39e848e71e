//! Connection manager
//!
//! Owns one authenticated broker session per device: connects with a freshly
//! signed credential, replays subscriptions, renews the credential before it
//! expires and reconnects with backoff when the session drops.
//!
//! Pure decisions live in [`connection`] and [`health_monitor`]; all I/O and
//! timers are owned by the event loop behind [`ConnectionManager`].

pub mod client;
pub mod connection;
pub mod dispatch;
mod event_loop;
pub mod health_monitor;
mod inflight;
pub mod registry;

pub use client::ConnectionManager;
pub use connection::{ConnectionState, ManagerError, ManagerSettings, ReconnectPolicy};
pub use dispatch::MessageHandler;
pub use health_monitor::{ConnectionQuality, HealthMetrics, HealthMonitor};
pub use registry::{SubscriptionHandle, SubscriptionId};
