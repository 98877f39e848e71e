//! Device identity and broker-facing names
//!
//! A [`DeviceIdentity`] is created once at startup from configuration and never
//! mutated. Everything the broker sees about the device (client id, token
//! audience, topic namespace) is derived from it.

use crate::topics::{canonicalize_topic, validate_identifier, ValidationError};
use std::fmt;

/// Immutable project / region / registry / device identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    project_id: String,
    region: String,
    registry_id: String,
    device_id: String,
}

impl DeviceIdentity {
    /// Build a validated identity
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let identity = Self {
            project_id: project_id.into(),
            region: region.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
        };

        validate_identifier("project_id", &identity.project_id)?;
        validate_identifier("region", &identity.region)?;
        validate_identifier("registry_id", &identity.registry_id)?;
        validate_identifier("device_id", &identity.device_id)?;

        Ok(identity)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Fully qualified device path, used verbatim as the MQTT client id:
    /// `projects/{project}/locations/{region}/registries/{registry}/devices/{device}`
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, self.device_id
        )
    }

    /// Audience claim for signed credentials
    pub fn audience(&self) -> &str {
        &self.project_id
    }

    pub fn topics(&self) -> DeviceTopics<'_> {
        DeviceTopics { identity: self }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id())
    }
}

/// Per-device topic construction under `/devices/{device}`
#[derive(Debug, Clone, Copy)]
pub struct DeviceTopics<'a> {
    identity: &'a DeviceIdentity,
}

impl DeviceTopics<'_> {
    /// Configuration channel pushed by the registry: `/devices/{device}/config`
    pub fn config(&self) -> String {
        self.build("config")
    }

    /// Telemetry channel: `/devices/{device}/events`
    pub fn telemetry(&self) -> String {
        self.build("events")
    }

    /// Telemetry sub-folder: `/devices/{device}/events/{subfolder}`
    pub fn telemetry_subfolder(&self, subfolder: &str) -> String {
        canonicalize_topic(&format!("{}/{subfolder}", self.telemetry()))
    }

    /// Device state reports: `/devices/{device}/state`
    pub fn state(&self) -> String {
        self.build("state")
    }

    /// Command filter covering every sub-folder: `/devices/{device}/commands/#`
    pub fn commands(&self) -> String {
        self.build("commands/#")
    }

    fn build(&self, suffix: &str) -> String {
        canonicalize_topic(&format!("/devices/{}/{suffix}", self.identity.device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("p", "us-central1", "r", "d").unwrap()
    }

    #[test]
    fn test_client_id_format() {
        assert_eq!(
            identity().client_id(),
            "projects/p/locations/us-central1/registries/r/devices/d"
        );
        assert_eq!(identity().to_string(), identity().client_id());
    }

    #[test]
    fn test_audience_is_project() {
        assert_eq!(identity().audience(), "p");
    }

    #[test]
    fn test_topic_construction() {
        let identity = identity();
        let topics = identity.topics();
        assert_eq!(topics.config(), "/devices/d/config");
        assert_eq!(topics.telemetry(), "/devices/d/events");
        assert_eq!(topics.state(), "/devices/d/state");
        assert_eq!(topics.commands(), "/devices/d/commands/#");
        assert_eq!(
            topics.telemetry_subfolder("/alerts/"),
            "/devices/d/events/alerts"
        );
    }

    #[test]
    fn test_invalid_identity_rejected() {
        assert!(DeviceIdentity::new("", "us-central1", "r", "d").is_err());
        assert!(DeviceIdentity::new("p", "us-central1", "r/x", "d").is_err());
        assert!(DeviceIdentity::new("p", "us-central1", "r", "d#").is_err());
    }
}
