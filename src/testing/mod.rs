//! Testing utilities and mock implementations
//!
//! Drive the connection manager without a real MQTT broker or wall clock.

pub mod mocks;

pub use mocks::*;
