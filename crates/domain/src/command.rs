//! Commands sent to sensors and the results they produce.
//!
//! A [`Command`] is the typed form of what the control surface carries as
//! `{"command": "<kind>", "args": [..]}`; conversion between the two checks
//! argument counts and ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::sensor::SensorId;
use crate::time::Timestamp;

/// Maximum number of detection range segments a device accepts.
pub const MAX_RANGE_SEGMENTS: usize = 4;

/// Highest sensitivity level.
pub const MAX_SENSITIVITY: u8 = 9;

/// Discriminant of a [`Command`], used on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "reset")]
    Reset,
    #[serde(rename = "latency")]
    ConfigureLatency,
    #[serde(rename = "detrange")]
    ConfigureRange,
    #[serde(rename = "sensitivity")]
    ConfigureSensitivity,
    #[serde(rename = "status")]
    QueryStatus,
    #[serde(rename = "enable")]
    Enable,
    #[serde(rename = "disable")]
    Disable,
}

impl CommandKind {
    /// Wire name of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
            Self::ConfigureLatency => "latency",
            Self::ConfigureRange => "detrange",
            Self::ConfigureSensitivity => "sensitivity",
            Self::QueryStatus => "status",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "reset" => Self::Reset,
            "latency" => Self::ConfigureLatency,
            "detrange" => Self::ConfigureRange,
            "sensitivity" => Self::ConfigureSensitivity,
            "status" => Self::QueryStatus,
            "enable" => Self::Enable,
            "disable" => Self::Disable,
            other => {
                return Err(ValidationError::InvalidArgument {
                    command: "command",
                    reason: format!("command {other} is not recognized"),
                });
            }
        };
        Ok(kind)
    }
}

/// One detection range segment, in device units (15 cm).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSegment {
    pub start: u16,
    pub end: u16,
}

impl RangeSegment {
    /// Segment bounds in centimetres.
    #[must_use]
    pub fn as_cm(self) -> (u32, u32) {
        (u32::from(self.start) * 15, u32::from(self.end) * 15)
    }
}

/// A typed device command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "CommandSpec", try_from = "CommandSpec")]
pub enum Command {
    Start,
    Stop,
    Reset,
    /// Detection and disappearance delays, in 25 ms units.
    Latency { detection: u16, disappearance: u16 },
    /// Up to [`MAX_RANGE_SEGMENTS`] ascending, non-overlapping segments.
    DetectionRange(Vec<RangeSegment>),
    /// Sensitivity level `0..=9`.
    Sensitivity(u8),
    Status,
    Enable,
    Disable,
}

impl Command {
    /// The command's discriminant.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Start => CommandKind::Start,
            Self::Stop => CommandKind::Stop,
            Self::Reset => CommandKind::Reset,
            Self::Latency { .. } => CommandKind::ConfigureLatency,
            Self::DetectionRange(_) => CommandKind::ConfigureRange,
            Self::Sensitivity(_) => CommandKind::ConfigureSensitivity,
            Self::Status => CommandKind::QueryStatus,
            Self::Enable => CommandKind::Enable,
            Self::Disable => CommandKind::Disable,
        }
    }

    /// Configuration commands change persisted device settings.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Latency { .. } | Self::DetectionRange(_) | Self::Sensitivity(_)
        )
    }

    /// `stop` and `reset` cancel whatever is awaiting confirmation.
    #[must_use]
    pub fn supersedes(&self) -> bool {
        matches!(self, Self::Stop | Self::Reset)
    }

    /// Commands answered by the instance itself, without device IO.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Status | Self::Enable | Self::Disable)
    }

    /// Build a command from its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidArgument`] when the argument count
    /// or a value is out of range.
    pub fn from_args(kind: CommandKind, args: &[i64]) -> Result<Self, ValidationError> {
        match kind {
            CommandKind::Start => no_args("start", args).map(|()| Self::Start),
            CommandKind::Stop => no_args("stop", args).map(|()| Self::Stop),
            CommandKind::Reset => no_args("reset", args).map(|()| Self::Reset),
            CommandKind::QueryStatus => no_args("status", args).map(|()| Self::Status),
            CommandKind::Enable => no_args("enable", args).map(|()| Self::Enable),
            CommandKind::Disable => no_args("disable", args).map(|()| Self::Disable),
            CommandKind::ConfigureLatency => {
                let [detection, disappearance] = args else {
                    return Err(invalid("latency", "expected 2 arguments"));
                };
                Ok(Self::Latency {
                    detection: to_u16("latency", *detection)?,
                    disappearance: to_u16("latency", *disappearance)?,
                })
            }
            CommandKind::ConfigureRange => parse_segments(args).map(Self::DetectionRange),
            CommandKind::ConfigureSensitivity => {
                let [level] = args else {
                    return Err(invalid("sensitivity", "expected 1 argument"));
                };
                match u8::try_from(*level) {
                    Ok(level) if level <= MAX_SENSITIVITY => Ok(Self::Sensitivity(level)),
                    _ => Err(invalid(
                        "sensitivity",
                        format!("{level} is outside 0..={MAX_SENSITIVITY}"),
                    )),
                }
            }
        }
    }

    /// Wire arguments of the command.
    #[must_use]
    pub fn args(&self) -> Vec<i64> {
        match self {
            Self::Latency {
                detection,
                disappearance,
            } => vec![i64::from(*detection), i64::from(*disappearance)],
            Self::DetectionRange(segments) => segments
                .iter()
                .flat_map(|seg| [i64::from(seg.start), i64::from(seg.end)])
                .collect(),
            Self::Sensitivity(level) => vec![i64::from(*level)],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args();
        if args.is_empty() {
            return f.write_str(self.kind().as_str());
        }
        let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
        write!(f, "{} {}", self.kind(), rendered.join(" "))
    }
}

/// Wire form of a [`Command`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: CommandKind,
    #[serde(default)]
    pub args: Vec<i64>,
}

impl From<Command> for CommandSpec {
    fn from(command: Command) -> Self {
        Self {
            command: command.kind(),
            args: command.args(),
        }
    }
}

impl TryFrom<CommandSpec> for Command {
    type Error = ValidationError;

    fn try_from(spec: CommandSpec) -> Result<Self, Self::Error> {
        Self::from_args(spec.command, &spec.args)
    }
}

fn invalid(command: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidArgument {
        command,
        reason: reason.into(),
    }
}

fn no_args(command: &'static str, args: &[i64]) -> Result<(), ValidationError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(invalid(command, "takes no arguments"))
    }
}

fn to_u16(command: &'static str, value: i64) -> Result<u16, ValidationError> {
    u16::try_from(value).map_err(|_| invalid(command, format!("{value} is outside 0..=65535")))
}

fn parse_segments(args: &[i64]) -> Result<Vec<RangeSegment>, ValidationError> {
    if args.is_empty() || args.len() % 2 != 0 || args.len() > MAX_RANGE_SEGMENTS * 2 {
        return Err(invalid(
            "detrange",
            format!("expected 1 to {MAX_RANGE_SEGMENTS} start/end pairs"),
        ));
    }

    let mut segments: Vec<RangeSegment> = Vec::with_capacity(args.len() / 2);
    for pair in args.chunks_exact(2) {
        let segment = RangeSegment {
            start: to_u16("detrange", pair[0])?,
            end: to_u16("detrange", pair[1])?,
        };
        if segment.start >= segment.end {
            return Err(invalid(
                "detrange",
                format!("segment start {} must be below end {}", segment.start, segment.end),
            ));
        }
        if let Some(prev) = segments.last()
            && segment.start <= prev.end
        {
            return Err(invalid(
                "detrange",
                "segments must be ascending and must not overlap",
            ));
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Why a command failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The device finished its response without acknowledging the command.
    NoCommandConfirmation,
    /// Another command is already awaiting confirmation.
    Busy,
    /// A `stop` or `reset` cancelled this command.
    Superseded,
    /// The device family has no such command.
    Unsupported,
    /// The command is not allowed from the sensor's lifecycle state; the
    /// detail names that state.
    InvalidState(String),
    /// The device reported a failure; the text is passed through verbatim.
    Device(String),
    /// The transport failed while the command was in flight.
    Transport(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCommandConfirmation => f.write_str("NO_COMMAND_CONFIRMATION"),
            Self::Busy => f.write_str("BUSY"),
            Self::Superseded => f.write_str("SUPERSEDED"),
            Self::Unsupported => f.write_str("UNSUPPORTED"),
            Self::InvalidState(state) => write!(f, "INVALID_STATE: {state}"),
            Self::Device(text) => write!(f, "DEVICE: {text}"),
            Self::Transport(text) => write!(f, "TRANSPORT: {text}"),
        }
    }
}

/// A command addressed to one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub sensor_name: String,
    #[serde(flatten)]
    pub command: Command,
    pub issued_at: Timestamp,
}

impl CommandRequest {
    /// Create a request stamped with the current time.
    #[must_use]
    pub fn new(sensor_name: impl Into<String>, command: Command) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            command,
            issued_at: crate::time::now(),
        }
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// The device acknowledged the command.
    Confirmed { lines: Vec<String> },
    /// The command failed.
    Failed {
        failure: FailureKind,
        lines: Vec<String>,
    },
    /// No recognised token arrived before the deadline.
    TimedOut { lines: Vec<String> },
}

impl CommandOutcome {
    /// A failure without collected output.
    #[must_use]
    pub fn failed(failure: FailureKind) -> Self {
        Self::Failed {
            failure,
            lines: Vec::new(),
        }
    }

    /// Raw device output collected while the command was in flight.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        match self {
            Self::Confirmed { lines } | Self::Failed { lines, .. } | Self::TimedOut { lines } => {
                lines
            }
        }
    }

    /// Whether the device acknowledged the command.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed { .. } => f.write_str("confirmed"),
            Self::Failed { failure, .. } => write!(f, "failed ({failure})"),
            Self::TimedOut { .. } => f.write_str("timed out"),
        }
    }
}

/// Result of one command on one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub sensor_id: SensorId,
    pub request: CommandRequest,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
    pub completed_at: Timestamp,
}

impl CommandResult {
    /// Complete `request` with `outcome` now.
    #[must_use]
    pub fn complete(sensor_id: SensorId, request: CommandRequest, outcome: CommandOutcome) -> Self {
        Self {
            sensor_id,
            request,
            outcome,
            completed_at: crate::time::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorKind;

    #[test]
    fn should_parse_latency_arguments() {
        let cmd = Command::from_args(CommandKind::ConfigureLatency, &[40, 400]).unwrap();
        assert_eq!(
            cmd,
            Command::Latency {
                detection: 40,
                disappearance: 400
            }
        );
    }

    #[test]
    fn should_reject_latency_out_of_range() {
        let result = Command::from_args(CommandKind::ConfigureLatency, &[70_000, 1]);
        assert!(result.is_err());
    }

    #[test]
    fn should_parse_up_to_four_range_segments() {
        let cmd =
            Command::from_args(CommandKind::ConfigureRange, &[0, 3, 5, 7, 9, 12, 13, 20]).unwrap();
        let Command::DetectionRange(segments) = cmd else {
            panic!("expected detection range");
        };
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[1].as_cm(), (75, 105));
    }

    #[test]
    fn should_reject_five_range_segments() {
        let args = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert!(Command::from_args(CommandKind::ConfigureRange, &args).is_err());
    }

    #[test]
    fn should_reject_odd_range_arguments() {
        assert!(Command::from_args(CommandKind::ConfigureRange, &[0, 3, 5]).is_err());
    }

    #[test]
    fn should_reject_overlapping_segments() {
        assert!(Command::from_args(CommandKind::ConfigureRange, &[0, 5, 4, 8]).is_err());
    }

    #[test]
    fn should_reject_inverted_segment() {
        assert!(Command::from_args(CommandKind::ConfigureRange, &[6, 2]).is_err());
    }

    #[test]
    fn should_reject_arguments_for_start() {
        assert!(Command::from_args(CommandKind::Start, &[1]).is_err());
    }

    #[test]
    fn should_reject_sensitivity_above_nine() {
        assert!(Command::from_args(CommandKind::ConfigureSensitivity, &[10]).is_err());
        assert_eq!(
            Command::from_args(CommandKind::ConfigureSensitivity, &[7]).unwrap(),
            Command::Sensitivity(7)
        );
    }

    #[test]
    fn should_serialize_command_in_wire_form() {
        let cmd = Command::Latency {
            detection: 1,
            disappearance: 2,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json, serde_json::json!({"command": "latency", "args": [1, 2]}));
    }

    #[test]
    fn should_deserialize_command_without_args() {
        let cmd: Command = serde_json::from_str(r#"{"command": "stop"}"#).unwrap();
        assert_eq!(cmd, Command::Stop);
    }

    #[test]
    fn should_reject_unknown_command_name() {
        assert!("explode".parse::<CommandKind>().is_err());
        assert_eq!("detrange".parse::<CommandKind>().unwrap(), CommandKind::ConfigureRange);
    }

    #[test]
    fn should_classify_superseding_and_local_commands() {
        assert!(Command::Stop.supersedes());
        assert!(Command::Reset.supersedes());
        assert!(!Command::Start.supersedes());
        assert!(Command::Status.is_local());
        assert!(Command::Sensitivity(3).is_config());
    }

    #[test]
    fn should_serialize_failure_kinds() {
        let busy = serde_json::to_value(FailureKind::Busy).unwrap();
        assert_eq!(busy, serde_json::json!({"kind": "BUSY"}));
        let device = serde_json::to_value(FailureKind::Device("Error".to_string())).unwrap();
        assert_eq!(device, serde_json::json!({"kind": "DEVICE", "detail": "Error"}));
        let state = FailureKind::InvalidState("disabled".to_string());
        assert_eq!(state.to_string(), "INVALID_STATE: disabled");
        assert_eq!(
            serde_json::to_value(state).unwrap(),
            serde_json::json!({"kind": "INVALID_STATE", "detail": "disabled"})
        );
    }

    #[test]
    fn should_roundtrip_command_result_through_serde_json() {
        let request = CommandRequest::new("desk", Command::Start);
        let result = CommandResult::complete(
            SensorId::new(SensorKind::Sen0395, "desk"),
            request,
            CommandOutcome::TimedOut {
                lines: vec!["sensorStart".to_string()],
            },
        );
        let json = serde_json::to_string(&result).unwrap();
        let parsed: CommandResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn should_display_command_with_args() {
        let cmd = Command::Sensitivity(5);
        assert_eq!(cmd.to_string(), "sensitivity 5");
        assert_eq!(Command::Stop.to_string(), "stop");
    }
}
