//! SEN0311 (A02YYUW) ultrasonic distance sensor: binary frames at 9600 baud.
//!
//! The device streams `0xFF, H, L, SUM` frames continuously, where the
//! distance is `H << 8 | L` millimetres and `SUM = (0xFF + H + L) & 0xFF`.
//! It takes no commands: start, stop and reset only switch local processing,
//! and an enabled sensor processes frames from the moment its port is open.

use std::time::Duration;

use sensord_domain::command::{Command, FailureKind};
use sensord_domain::presence::PresencePolicy;
use sensord_domain::sample::Reading;
use sensord_domain::sensor::SensorKind;

use super::{DeviceOutput, DeviceProtocol, Step};
use crate::protocol::TokenSet;

pub const BAUD_RATE: u32 = 9_600;

const HEADER: u8 = 0xFF;
const FRAME_LEN: usize = 4;

#[derive(Debug, Default)]
pub struct Sen0311 {
    buffer: Vec<u8>,
}

fn checksum(high: u8, low: u8) -> u8 {
    HEADER.wrapping_add(high).wrapping_add(low)
}

impl DeviceProtocol for Sen0311 {
    fn kind(&self) -> SensorKind {
        SensorKind::Sen0311
    }

    fn default_baud_rate(&self) -> u32 {
        BAUD_RATE
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn default_policy(&self) -> PresencePolicy {
        PresencePolicy::distance()
    }

    fn tokens(&self) -> TokenSet {
        TokenSet {
            confirm: Vec::new(),
            failure: Vec::new(),
            prompt: None,
            end_of_response_confirms: false,
        }
    }

    fn reports_only_when_scanning(&self) -> bool {
        false
    }

    fn scans_when_open(&self) -> bool {
        true
    }

    fn feed(&mut self, bytes: &[u8]) -> Vec<DeviceOutput> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match self.buffer.iter().position(|b| *b == HEADER) {
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    break;
                }
            }
            if self.buffer.len() < FRAME_LEN {
                break;
            }
            let (high, low, sum) = (self.buffer[1], self.buffer[2], self.buffer[3]);
            if checksum(high, low) == sum {
                let millimetres = u16::from_be_bytes([high, low]);
                out.push(DeviceOutput::Reading(Reading::Distance(
                    f64::from(millimetres) / 10.0,
                )));
                self.buffer.drain(..FRAME_LEN);
            } else {
                tracing::trace!(high, low, sum, "dropping frame with bad checksum");
                self.buffer.drain(..1);
            }
        }
        out
    }

    fn plan(&self, command: &Command, _scanning: bool) -> Result<Vec<Step>, FailureKind> {
        if command.is_config() {
            return Err(FailureKind::Unsupported);
        }
        Ok(Vec::new())
    }
}
