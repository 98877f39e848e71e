//! Device configuration
//!
//! One TOML file describes the device identity, the broker, the credential
//! files and every connection tunable. Validation happens at load time so a
//! bad file fails startup instead of the first reconnect.

use crate::credentials::token::validate_lifetime;
use crate::credentials::SigningAlgorithm;
use crate::identity::DeviceIdentity;
use crate::manager::{ManagerSettings, ReconnectPolicy};
use crate::topics::ValidationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable consulted when `device.project_id` is omitted
pub const PROJECT_ID_ENV: &str = "PROJECT_ID";

/// Shortest keep-alive the broker accepts without dropping idle sessions early
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub broker: BrokerSection,
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Falls back to the `PROJECT_ID` environment variable
    #[serde(default)]
    pub project_id: Option<String>,
    pub region: String,
    pub registry_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_host() -> String {
    "mqtt.googleapis.com".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    /// PEM bundle of pinned root certificates
    pub roots_path: PathBuf,
    /// PEM private key registered for the device
    pub private_key_path: PathBuf,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
    #[serde(default = "default_token_lifetime_secs")]
    pub token_lifetime_secs: u64,
    #[serde(default = "default_renew_at_fraction")]
    pub renew_at_fraction: f64,
}

fn default_token_lifetime_secs() -> u64 {
    24 * 60 * 60
}

fn default_renew_at_fraction() -> f64 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Omitted inside a `[reconnect]` section: never reported as exhausted
    pub retry_budget: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            retry_budget: Some(10),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsSection {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_ack_secs")]
    pub ack_secs: u64,
    #[serde(default = "default_close_drain_secs")]
    pub close_drain_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            ack_secs: default_ack_secs(),
            close_drain_secs: default_close_drain_secs(),
        }
    }
}

fn default_connect_secs() -> u64 {
    30
}

fn default_ack_secs() -> u64 {
    10
}

fn default_close_drain_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    /// Bound of each subscription's handler queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    5
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] ValidationError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceConfig {
    /// Load, resolve environment fallbacks and validate a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: DeviceConfig = toml::from_str(content)?;
        config.resolve_project_id(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Fill an omitted project id from the environment
    fn resolve_project_id(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if self.device.project_id.is_some() {
            return Ok(());
        }

        let project_id = lookup(PROJECT_ID_ENV)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::EnvVarNotFound(PROJECT_ID_ENV.to_string()))?;
        self.device.project_id = Some(project_id);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;

        if self.broker.port == 0 {
            return Err(ConfigError::InvalidConfig("broker.port cannot be 0".to_string()));
        }
        if self.broker.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }

        validate_lifetime(self.token_lifetime())
            .map_err(|e| ConfigError::InvalidConfig(format!("credentials.token_lifetime_secs: {e}")))?;

        self.manager_settings()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let project_id = self
            .device
            .project_id
            .clone()
            .ok_or_else(|| ConfigError::EnvVarNotFound(PROJECT_ID_ENV.to_string()))?;

        Ok(DeviceIdentity::new(
            project_id,
            self.device.region.clone(),
            self.device.registry_id.clone(),
            self.device.device_id.clone(),
        )?)
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.credentials.token_lifetime_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            token_lifetime: self.token_lifetime(),
            renew_at_fraction: self.credentials.renew_at_fraction,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                jitter: self.reconnect.jitter,
                retry_budget: self.reconnect.retry_budget,
            },
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs),
            ack_timeout: Duration::from_secs(self.timeouts.ack_secs),
            close_drain_timeout: Duration::from_secs(self.timeouts.close_drain_secs),
            dispatch_queue_capacity: self.dispatch.queue_capacity,
            ..ManagerSettings::default()
        }
    }

    /// Render back to TOML, as resolved
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
project_id = "my-project"
region = "us-central1"
registry_id = "my-registry"
device_id = "my-device"

[credentials]
roots_path = "roots.pem"
private_key_path = "rsa_private.pem"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = DeviceConfig::load_from_str(MINIMAL).unwrap();

        assert_eq!(config.broker, BrokerSection::default());
        assert_eq!(config.broker.host, "mqtt.googleapis.com");
        assert_eq!(config.credentials.algorithm, SigningAlgorithm::RS256);
        assert_eq!(config.token_lifetime(), Duration::from_secs(86_400));
        assert_eq!(config.reconnect.retry_budget, Some(10));
        assert_eq!(config.telemetry_interval(), Duration::from_secs(5));

        let settings = config.manager_settings();
        assert_eq!(settings.port, 8883);
        assert_eq!(settings.renew_at_fraction, 0.9);
        assert_eq!(settings.ack_timeout, Duration::from_secs(10));
        assert_eq!(settings.dispatch_queue_capacity, 64);
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
project_id = "p"
region = "europe-west1"
registry_id = "r"
device_id = "d"

[broker]
host = "mqtt.example.com"
port = 443
keep_alive_secs = 30

[credentials]
roots_path = "/etc/iotlink/roots.pem"
private_key_path = "/etc/iotlink/ec_private.pem"
algorithm = "ES256"
token_lifetime_secs = 3600
renew_at_fraction = 0.8

[reconnect]
base_delay_ms = 500
max_delay_ms = 30000
jitter = 0.1

[timeouts]
connect_secs = 15
ack_secs = 5
close_drain_secs = 2

[dispatch]
queue_capacity = 8

[telemetry]
interval_secs = 60
"#;

        let config = DeviceConfig::load_from_str(toml_content).unwrap();
        let identity = config.identity().unwrap();
        assert_eq!(
            identity.client_id(),
            "projects/p/locations/europe-west1/registries/r/devices/d"
        );

        let settings = config.manager_settings();
        assert_eq!(settings.host, "mqtt.example.com");
        assert_eq!(settings.keep_alive, Duration::from_secs(30));
        assert_eq!(settings.token_lifetime, Duration::from_secs(3600));
        assert_eq!(settings.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(settings.reconnect.retry_budget, None);
        assert_eq!(settings.connect_timeout, Duration::from_secs(15));
        assert_eq!(settings.close_drain_timeout, Duration::from_secs(2));
        assert_eq!(settings.dispatch_queue_capacity, 8);
        assert_eq!(config.credentials.algorithm, SigningAlgorithm::ES256);
    }

    #[test]
    fn test_project_id_resolved_from_lookup() {
        let toml_content = MINIMAL.replace("project_id = \"my-project\"\n", "");
        let mut config: DeviceConfig = toml::from_str(&toml_content).unwrap();

        let missing = config.clone().resolve_project_id(|_| None);
        assert!(matches!(missing, Err(ConfigError::EnvVarNotFound(name)) if name == PROJECT_ID_ENV));

        config
            .resolve_project_id(|name| (name == PROJECT_ID_ENV).then(|| "from-env".to_string()))
            .unwrap();
        assert_eq!(config.identity().unwrap().project_id(), "from-env");
    }

    #[test]
    fn test_keep_alive_floor() {
        let toml_content = format!("{MINIMAL}\n[broker]\nkeep_alive_secs = 4\n");
        let result = DeviceConfig::load_from_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_token_lifetime_over_a_day_rejected() {
        let toml_content = MINIMAL.replace(
            "private_key_path = \"rsa_private.pem\"",
            "private_key_path = \"rsa_private.pem\"\ntoken_lifetime_secs = 90000",
        );
        let result = DeviceConfig::load_from_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let toml_content = MINIMAL.replace("my-device", "my/device");
        let result = DeviceConfig::load_from_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidIdentity(_))));
    }

    #[test]
    fn test_invalid_reconnect_policy_rejected() {
        let toml_content = format!("{MINIMAL}\n[reconnect]\nbase_delay_ms = 0\n");
        let result = DeviceConfig::load_from_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_section_is_parse_error() {
        let result = DeviceConfig::load_from_str("[device]\nregion = \"r\"\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = DeviceConfig::load_from_str(MINIMAL).unwrap();
        let rendered = config.to_toml().unwrap();
        assert_eq!(DeviceConfig::load_from_str(&rendered).unwrap(), config);
    }
}
