//! Event: the wire-stable record delivered to sinks.
//!
//! ```json
//! {"sensorId":"sen0395/desk","event":"presence_change","eventAt":"2024-05-30T06:25:13.929544+00:00","eventData":{"presence":false}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::presence::PresenceChange;
use crate::sensor::SensorId;
use crate::time::Timestamp;

/// Tag of presence transition events.
pub const PRESENCE_CHANGE: &str = "presence_change";

/// An immutable event emitted by a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub sensor_id: SensorId,
    pub event: String,
    #[serde(with = "crate::time::event_time")]
    pub event_at: Timestamp,
    pub event_data: Map<String, Value>,
}

impl Event {
    #[must_use]
    pub fn new(
        sensor_id: SensorId,
        event: impl Into<String>,
        event_at: Timestamp,
        event_data: Map<String, Value>,
    ) -> Self {
        Self {
            sensor_id,
            event: event.into(),
            event_at,
            event_data,
        }
    }

    /// Build a `presence_change` event stamped at `event_at`.
    #[must_use]
    pub fn presence_change(sensor_id: SensorId, present: bool, event_at: Timestamp) -> Self {
        let mut data = Map::new();
        data.insert("presence".to_string(), Value::Bool(present));
        Self::new(sensor_id, PRESENCE_CHANGE, event_at, data)
    }

    /// Build a `presence_change` event from a confirmed filter transition.
    #[must_use]
    pub fn from_change(sensor_id: SensorId, change: &PresenceChange) -> Self {
        Self::presence_change(sensor_id, change.present, change.confirmed_at)
    }

    /// JSON payload as published to sinks.
    ///
    /// # Errors
    ///
    /// Fails only if a custom `event_data` value cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::SensorKind;
    use chrono::{DateTime, Utc};

    const LITERAL: &str = r#"{"sensorId":"sen0395/desk","event":"presence_change","eventAt":"2024-05-30T06:25:13.929544+00:00","eventData":{"presence":false}}"#;

    fn at(raw: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn should_serialize_to_literal_wire_schema() {
        let event = Event::presence_change(
            SensorId::new(SensorKind::Sen0395, "desk"),
            false,
            at("2024-05-30T06:25:13.929544+00:00"),
        );
        assert_eq!(event.to_json().unwrap(), LITERAL);
    }

    #[test]
    fn should_parse_literal_wire_schema() {
        let event: Event = serde_json::from_str(LITERAL).unwrap();
        assert_eq!(event.sensor_id.to_string(), "sen0395/desk");
        assert_eq!(event.event, PRESENCE_CHANGE);
        assert_eq!(event.event_data.get("presence"), Some(&Value::Bool(false)));
        assert_eq!(serde_json::to_string(&event).unwrap(), LITERAL);
    }

    #[test]
    fn should_build_event_from_presence_change() {
        let ts = at("2024-01-01T00:00:00Z");
        let change = PresenceChange {
            present: true,
            confirmed_at: ts,
        };
        let event = Event::from_change(SensorId::new(SensorKind::Sen0311, "hall"), &change);
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"sensorId":"sen0311/hall","event":"presence_change","eventAt":"2024-01-01T00:00:00.000000+00:00","eventData":{"presence":true}}"#
        );
    }
}
