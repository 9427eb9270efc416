//! Configuration loading: TOML file with environment variable overrides.
//!
//! Reads `sensord.toml` (or the path given with `--config` /
//! `SENSORD_CONFIG`). Every section has defaults so the file is optional.
//! Environment variables take precedence over file values.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use sensord_adapter_mqtt::BrokerConfig;
use sensord_adapter_ws::EndpointConfig;
use sensord_app::devices::protocol_for;
use sensord_app::dispatcher::DispatcherSettings;
use sensord_domain::error::ValidationError;
use sensord_domain::presence::PresencePolicy;
use sensord_domain::sensor::{ProtocolOverrides, SensorConfig, SensorKind};
use sensord_domain::sink::SinkBinding;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Control socket settings.
    pub api: ApiConfig,
    /// Event dispatcher tuning.
    pub dispatcher: DispatcherConfig,
    /// MQTT brokers.
    pub mqtt: MqttSection,
    /// WebSocket endpoints.
    pub ws: WsSection,
    /// Configured sensors, in file order.
    pub sensor: Vec<SensorEntry>,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Control socket configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Path of the Unix domain socket.
    pub socket_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub backlog_capacity: usize,
    pub local_capacity: usize,
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub broker: Vec<BrokerConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WsSection {
    pub endpoint: Vec<EndpointConfig>,
}

/// One `[[sensor]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    /// Serial port path.
    pub port: String,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub print_presence: bool,
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,
    #[serde(default)]
    pub command_retries: u8,
    #[serde(default)]
    pub presence: Option<PresenceEntry>,
    #[serde(default)]
    pub protocol: ProtocolOverrides,
    #[serde(default)]
    pub mqtt: Vec<MqttBindingEntry>,
    #[serde(default)]
    pub ws: Vec<WsBindingEntry>,
}

fn enabled_by_default() -> bool {
    true
}

/// Presence filter overrides; unset fields keep the device family default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PresenceEntry {
    pub threshold_presence: Option<u32>,
    pub threshold_absence: Option<u32>,
    pub hysteresis_count: Option<u32>,
    pub delay_presence_ms: Option<u64>,
    pub delay_absence_ms: Option<u64>,
}

impl PresenceEntry {
    fn apply(&self, mut policy: PresencePolicy) -> PresencePolicy {
        if let Some(value) = self.threshold_presence {
            policy.threshold_presence = value;
        }
        if let Some(value) = self.threshold_absence {
            policy.threshold_absence = value;
        }
        if let Some(value) = self.hysteresis_count {
            policy.hysteresis_count = value;
        }
        if let Some(value) = self.delay_presence_ms {
            policy.delay_presence = Duration::from_millis(value);
        }
        if let Some(value) = self.delay_absence_ms {
            policy.delay_absence = Duration::from_millis(value);
        }
        policy
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttBindingEntry {
    pub broker: String,
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsBindingEntry {
    pub endpoint: String,
}

impl SensorEntry {
    /// Build the sensor descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the name is empty or the presence
    /// policy is inconsistent.
    pub fn to_config(&self) -> Result<SensorConfig, ValidationError> {
        let mut config = SensorConfig::new(self.name.trim(), self.kind, self.port.clone());
        config.baud_rate = self.baud_rate;
        config.enabled = self.enabled;
        config.autostart = self.autostart;
        config.print_presence = self.print_presence;
        config.command_timeout = self.command_timeout_ms.map(Duration::from_millis);
        config.command_retries = self.command_retries;
        config.protocol = self.protocol.clone();
        if let Some(presence) = &self.presence {
            let base = protocol_for(&config).default_policy();
            config.presence = Some(presence.apply(base));
        }
        config.sinks = self
            .mqtt
            .iter()
            .map(|binding| SinkBinding::Mqtt {
                broker: binding.broker.clone(),
                topic: binding.topic.clone(),
            })
            .chain(self.ws.iter().map(|binding| SinkBinding::WebSocket {
                endpoint: binding.endpoint.clone(),
            }))
            .collect();
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Load configuration from `path` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is malformed, or if brokers or
    /// endpoints are declared twice.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("SENSORD_SOCKET") {
            self.api.socket_path = PathBuf::from(val);
        }
        if let Some(val) = var("SENSORD_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "api.socket_path must not be empty".to_string(),
            ));
        }
        if self.dispatcher.backlog_capacity == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.backlog_capacity must be non-zero".to_string(),
            ));
        }
        if let Some(name) = first_duplicate(self.mqtt.broker.iter().map(|b| b.name.as_str())) {
            return Err(ConfigError::Validation(format!(
                "MQTT broker {name} is declared twice"
            )));
        }
        if let Some(name) = first_duplicate(self.ws.endpoint.iter().map(|e| e.name.as_str())) {
            return Err(ConfigError::Validation(format!(
                "WebSocket endpoint {name} is declared twice"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            backlog_capacity: self.dispatcher.backlog_capacity,
            local_capacity: self.dispatcher.local_capacity,
            shutdown_grace: Duration::from_millis(self.dispatcher.shutdown_grace_ms),
        }
    }

    /// Valid sensor descriptors, in file order.
    ///
    /// Invalid entries and repeated names are logged and skipped.
    #[must_use]
    pub fn sensor_configs(&self) -> Vec<SensorConfig> {
        let mut seen = BTreeSet::new();
        let mut configs = Vec::with_capacity(self.sensor.len());
        for entry in &self.sensor {
            match entry.to_config() {
                Ok(config) if !seen.insert(config.name.clone()) => {
                    tracing::warn!(sensor = %config.name, "duplicate sensor name, entry skipped");
                }
                Ok(config) => configs.push(config),
                Err(err) => {
                    tracing::warn!(sensor = %entry.name, %err, "invalid sensor configuration, entry skipped");
                }
            }
        }
        configs
    }
}

fn first_duplicate<'a>(mut names: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = BTreeSet::new();
    names.find(|name| !seen.insert(*name))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "sensord=info,sensord_app=info,sensord_adapter_serial=info,sensord_adapter_mqtt=info,sensord_adapter_ws=info,sensord_adapter_ipc=info".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/sensord/api.sock"),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let settings = DispatcherSettings::default();
        Self {
            backlog_capacity: settings.backlog_capacity,
            local_capacity: settings.local_capacity,
            shutdown_grace_ms: u64::try_from(settings.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
