//! SEN0395 mmWave presence radar: line-oriented text protocol at 115200 baud.
//!
//! ```text
//! leapMMW:/>sensorStop
//! Done
//! leapMMW:/>
//! $JYBSS,1, , , *
//! ```
//!
//! The prompt is printed without a trailing newline, so a partial buffer that
//! ends with it is flushed as a line of its own.

use std::time::Duration;

use sensord_domain::command::{Command, FailureKind};
use sensord_domain::presence::PresencePolicy;
use sensord_domain::sample::Reading;
use sensord_domain::sensor::SensorKind;

use super::{DeviceOutput, DeviceProtocol, Step, StepRole};
use crate::protocol::TokenSet;

pub const BAUD_RATE: u32 = 115_200;
pub const PROMPT: &str = "leapMMW:/>";
pub const SAVE_CONFIG: &str = "saveCfg 0x45670123 0xCDEF89AB 0x956128C6 0xDF54AC89";

const PRESENCE_PREFIX: &str = "$JYBSS";
const MAX_LINE: usize = 1024;

#[derive(Debug)]
pub struct Sen0395 {
    prompt: String,
    buffer: Vec<u8>,
}

impl Default for Sen0395 {
    fn default() -> Self {
        Self::with_prompt(PROMPT)
    }
}

impl Sen0395 {
    /// Decoder flushing partial lines that end with `prompt`.
    #[must_use]
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            buffer: Vec::new(),
        }
    }

    fn decode_line(raw: &[u8]) -> Option<DeviceOutput> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(reading) = parse_presence(text) {
            return Some(DeviceOutput::Reading(reading));
        }
        Some(DeviceOutput::Line(text.to_string()))
    }

    fn pending_is_prompt(&self) -> bool {
        !self.prompt.is_empty()
            && String::from_utf8_lossy(&self.buffer)
                .trim_end()
                .ends_with(self.prompt.as_str())
    }
}

/// Parse `$JYBSS,<0|1>, , , *` into a detection reading.
fn parse_presence(line: &str) -> Option<Reading> {
    let rest = line.strip_prefix(PRESENCE_PREFIX)?;
    let flag = rest.trim_start_matches(',').split(',').next()?.trim();
    match flag {
        "0" => Some(Reading::Detection(false)),
        "1" => Some(Reading::Detection(true)),
        _ => None,
    }
}

fn configure_chain(line: String, scanning: bool) -> Vec<Step> {
    let mut steps = Vec::with_capacity(4);
    if scanning {
        steps.push(Step::new(StepRole::Pause, "sensorStop"));
    }
    steps.push(Step::new(StepRole::Main, line));
    steps.push(Step::new(StepRole::Save, SAVE_CONFIG));
    if scanning {
        steps.push(Step::new(StepRole::Resume, "sensorStart"));
    }
    steps
}

impl DeviceProtocol for Sen0395 {
    fn kind(&self) -> SensorKind {
        SensorKind::Sen0395
    }

    fn default_baud_rate(&self) -> u32 {
        BAUD_RATE
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(3)
    }

    fn default_policy(&self) -> PresencePolicy {
        PresencePolicy::detection()
    }

    fn tokens(&self) -> TokenSet {
        TokenSet {
            confirm: vec!["Done".to_string()],
            failure: vec!["Error".to_string()],
            prompt: Some(PROMPT.to_string()),
            end_of_response_confirms: true,
        }
    }

    fn reports_only_when_scanning(&self) -> bool {
        true
    }

    fn scans_when_open(&self) -> bool {
        false
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<DeviceOutput> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            out.extend(Self::decode_line(&line));
        }
        if self.pending_is_prompt() || self.buffer.len() > MAX_LINE {
            let line = std::mem::take(&mut self.buffer);
            out.extend(Self::decode_line(&line));
        }
        out
    }

    fn plan(&self, command: &Command, scanning: bool) -> Result<Vec<Step>, FailureKind> {
        let steps = match command {
            Command::Start => vec![Step::new(StepRole::Main, "sensorStart")],
            Command::Stop => vec![Step::new(StepRole::Main, "sensorStop")],
            Command::Reset => vec![Step::new(StepRole::Main, "resetSystem")],
            Command::Latency {
                detection,
                disappearance,
            } => configure_chain(
                format!("outputLatency -1 {detection} {disappearance}"),
                scanning,
            ),
            Command::DetectionRange(segments) => {
                let mut line = String::from("detRangeCfg -1");
                for segment in segments {
                    line.push_str(&format!(" {} {}", segment.start, segment.end));
                }
                configure_chain(line, scanning)
            }
            Command::Sensitivity(level) => {
                configure_chain(format!("setSensitivity {level}"), scanning)
            }
            Command::Status | Command::Enable | Command::Disable => Vec::new(),
        };
        Ok(steps)
    }
}
