//! Sensor: identity, immutable configuration, lifecycle and status snapshot.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::CommandKind;
use crate::error::ValidationError;
use crate::presence::PresencePolicy;
use crate::sink::SinkBinding;

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// DFRobot SEN0395 mmWave presence radar.
    Sen0395,
    /// DFRobot SEN0311 (A02YYUW) ultrasonic distance sensor.
    Sen0311,
}

impl SensorKind {
    /// All families, in a stable order.
    pub const ALL: [Self; 2] = [Self::Sen0395, Self::Sen0311];

    /// Wire/config name (`"sen0395"`, `"sen0311"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sen0395 => "sen0395",
            Self::Sen0311 => "sen0311",
        }
    }

    /// Human description of the device family.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Sen0395 => "mmWave presence radar",
            Self::Sen0311 => "ultrasonic distance sensor",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a sensor kind or id cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sensor type {0}")]
pub struct UnknownSensorKind(pub String);

impl FromStr for SensorKind {
    type Err = UnknownSensorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sen0395" => Ok(Self::Sen0395),
            "sen0311" => Ok(Self::Sen0311),
            _ => Err(UnknownSensorKind(s.to_string())),
        }
    }
}

/// Globally unique sensor identifier rendered as `"<kind>/<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SensorId {
    /// Device family.
    pub kind: SensorKind,
    /// Configured name, unique across the registry.
    pub name: String,
}

impl SensorId {
    /// Build an id from its parts.
    #[must_use]
    pub fn new(kind: SensorKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for SensorId {
    type Err = UnknownSensorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| UnknownSensorKind(s.to_string()))?;
        Ok(Self::new(kind.parse()?, name))
    }
}

impl TryFrom<String> for SensorId {
    type Error = UnknownSensorKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SensorId> for String {
    fn from(id: SensorId) -> Self {
        id.to_string()
    }
}

/// Operational phase of a sensor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    /// Reading and processing is switched off.
    Disabled,
    /// The device is not scanning.
    Stopped,
    /// A start command is in flight.
    Starting,
    /// The device is scanning and producing samples.
    Scanning,
    /// A stop command is in flight.
    Stopping,
    /// The instance failed; only `reset` or `stop` + `start` recovers it.
    Error {
        /// Why the instance failed.
        reason: String,
    },
}

impl LifecycleState {
    /// Whether a start/stop transition is in flight.
    #[must_use]
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// Whether the instance is in the error state.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Resting state for a device that is not scanning.
    #[must_use]
    pub fn idle(enabled: bool) -> Self {
        if enabled { Self::Stopped } else { Self::Disabled }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Stopped => f.write_str("stopped"),
            Self::Starting => f.write_str("starting"),
            Self::Scanning => f.write_str("scanning"),
            Self::Stopping => f.write_str("stopping"),
            Self::Error { reason } => write!(f, "error({reason})"),
        }
    }
}

/// Last confirmed presence of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
    #[default]
    Unknown,
}

impl Presence {
    /// Boolean view used in event payloads; `None` when unknown.
    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Present => Some(true),
            Self::Absent => Some(false),
            Self::Unknown => None,
        }
    }
}

impl From<bool> for Presence {
    fn from(present: bool) -> Self {
        if present { Self::Present } else { Self::Absent }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present => f.write_str("present"),
            Self::Absent => f.write_str("absent"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Per-sensor overrides of the device family's token vocabulary.
///
/// `None` keeps the family default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOverrides {
    /// Lines that confirm the issued command.
    pub confirm_tokens: Option<Vec<String>>,
    /// Lines that fail the issued command.
    pub failure_tokens: Option<Vec<String>>,
    /// End-of-response prompt printed by the device.
    pub prompt: Option<String>,
    /// Whether reaching the prompt after the command echo confirms the command.
    pub end_of_response_confirms: Option<bool>,
}

/// Immutable descriptor of one configured sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    /// Unique name.
    pub name: String,
    /// Device family.
    pub kind: SensorKind,
    /// Transport reference (serial port path).
    pub transport: String,
    /// Transport speed override; the family default applies when `None`.
    pub baud_rate: Option<u32>,
    /// Whether samples are read and processed into events.
    pub enabled: bool,
    /// Issue `start` right after registration.
    pub autostart: bool,
    /// Log every confirmed presence change.
    pub print_presence: bool,
    /// Confirmation timeout override.
    pub command_timeout: Option<Duration>,
    /// How many times a timed-out step is resent.
    pub command_retries: u8,
    /// Presence filter policy override.
    pub presence: Option<PresencePolicy>,
    /// Token vocabulary overrides.
    pub protocol: ProtocolOverrides,
    /// Where this sensor's events are delivered.
    pub sinks: Vec<SinkBinding>,
}

impl SensorConfig {
    /// Create a config with defaults for everything but identity and transport.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: SensorKind, transport: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            transport: transport.into(),
            baud_rate: None,
            enabled: true,
            autostart: false,
            print_presence: false,
            command_timeout: None,
            command_retries: 0,
            presence: None,
            protocol: ProtocolOverrides::default(),
            sinks: Vec::new(),
        }
    }

    /// The sensor's wire identifier.
    #[must_use]
    pub fn id(&self) -> SensorId {
        SensorId::new(self.kind, self.name.clone())
    }

    /// Check the invariants of the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the name is empty or the presence
    /// policy is inconsistent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if let Some(policy) = &self.presence {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Point-in-time view of a sensor instance, returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatus {
    pub sensor_id: SensorId,
    pub transport: String,
    pub enabled: bool,
    pub lifecycle: LifecycleState,
    pub presence: Presence,
    /// Last measured distance, for distance sensors.
    pub distance_cm: Option<f64>,
    /// Command currently awaiting confirmation.
    pub pending_command: Option<CommandKind>,
}

impl SensorStatus {
    /// Initial status of a freshly registered sensor.
    #[must_use]
    pub fn initial(config: &SensorConfig) -> Self {
        Self {
            sensor_id: config.id(),
            transport: config.transport.clone(),
            enabled: config.enabled,
            lifecycle: LifecycleState::idle(config.enabled),
            presence: Presence::Unknown,
            distance_cm: None,
            pending_command: None,
        }
    }
}
