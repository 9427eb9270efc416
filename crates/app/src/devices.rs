//! Device families: wire encoding and decoding per sensor type.
//!
//! Each family implements [`DeviceProtocol`]: it decodes the raw byte stream
//! into output lines and readings, provides its token vocabulary, and plans
//! the wire steps a [`Command`] expands to.

pub mod sen0311;
pub mod sen0395;

use std::time::Duration;

use sensord_domain::command::{Command, FailureKind};
use sensord_domain::presence::PresencePolicy;
use sensord_domain::sample::Reading;
use sensord_domain::sensor::{SensorConfig, SensorKind};

use crate::protocol::TokenSet;

/// Something decoded from the device byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutput {
    /// A text line (command echo, token, prompt, diagnostics).
    Line(String),
    /// A measurement.
    Reading(Reading),
}

/// Role of a step inside a command plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// The command itself.
    Main,
    /// Stop scanning before reconfiguring.
    Pause,
    /// Persist the new configuration.
    Save,
    /// Restart scanning after a pause.
    Resume,
}

/// One wire command awaiting one confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub role: StepRole,
    /// Command line as written to the device, without line terminator.
    pub line: String,
}

impl Step {
    #[must_use]
    pub fn new(role: StepRole, line: impl Into<String>) -> Self {
        Self {
            role,
            line: line.into(),
        }
    }

    /// Bytes written to the transport.
    #[must_use]
    pub fn wire(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.line.len() + 1);
        bytes.extend_from_slice(self.line.as_bytes());
        bytes.push(b'\n');
        bytes
    }
}

/// Capabilities of one device family.
pub trait DeviceProtocol: Send {
    fn kind(&self) -> SensorKind;

    fn default_baud_rate(&self) -> u32;

    /// Confirmation timeout when the sensor does not override it.
    fn default_timeout(&self) -> Duration;

    /// Presence policy when the sensor does not override it.
    fn default_policy(&self) -> PresencePolicy;

    /// Default token vocabulary.
    fn tokens(&self) -> TokenSet;

    /// Whether samples only arrive while the device scans. When true, a
    /// sample seen while stopped means the device is already scanning.
    fn reports_only_when_scanning(&self) -> bool;

    /// Whether the device streams as soon as its transport is open. Such a
    /// sensor rests in `Scanning` rather than `Stopped` while enabled.
    fn scans_when_open(&self) -> bool;

    /// Decode the next chunk of bytes.
    fn feed(&mut self, bytes: &[u8]) -> Vec<DeviceOutput>;

    /// Expand `command` into wire steps. An empty plan means the command is
    /// handled locally and confirmed immediately.
    ///
    /// # Errors
    ///
    /// Returns [`FailureKind::Unsupported`] when the family has no such
    /// command.
    fn plan(&self, command: &Command, scanning: bool) -> Result<Vec<Step>, FailureKind>;
}

/// Build the protocol implementation for a sensor's device family.
#[must_use]
pub fn protocol_for(config: &SensorConfig) -> Box<dyn DeviceProtocol> {
    match config.kind {
        SensorKind::Sen0395 => match &config.protocol.prompt {
            Some(prompt) => Box::new(sen0395::Sen0395::with_prompt(prompt.clone())),
            None => Box::new(sen0395::Sen0395::default()),
        },
        SensorKind::Sen0311 => Box::new(sen0311::Sen0311::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_pick_protocol_by_kind() {
        for kind in SensorKind::ALL {
            let config = SensorConfig::new("any", kind, "/dev/null");
            assert_eq!(protocol_for(&config).kind(), kind);
        }
    }

    #[test]
    fn should_only_let_distance_sensor_scan_when_open() {
        let radar = SensorConfig::new("desk", SensorKind::Sen0395, "/dev/null");
        let distance = SensorConfig::new("hall", SensorKind::Sen0311, "/dev/null");
        assert!(!protocol_for(&radar).scans_when_open());
        assert!(protocol_for(&distance).scans_when_open());
    }

    #[test]
    fn should_terminate_wire_line_with_newline() {
        let step = Step::new(StepRole::Main, "sensorStart");
        assert_eq!(step.wire(), b"sensorStart\n".to_vec());
    }
}
