//! Raw device readings.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// What a device measured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reading {
    /// Distance to the nearest object, in centimetres.
    Distance(f64),
    /// Binary detection report.
    Detection(bool),
}

/// One reading from one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub sensor_name: String,
    pub reading: Reading,
    pub observed_at: Timestamp,
}

impl RawSample {
    #[must_use]
    pub fn new(sensor_name: impl Into<String>, reading: Reading, observed_at: Timestamp) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            reading,
            observed_at,
        }
    }

    /// Measured distance, for distance readings.
    #[must_use]
    pub fn distance_cm(&self) -> Option<f64> {
        match self.reading {
            Reading::Distance(cm) => Some(cm),
            Reading::Detection(_) => None,
        }
    }
}
