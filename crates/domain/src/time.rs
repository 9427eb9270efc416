//! Time and timestamp helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// UTC timestamp used for sample observation times, command times and event times.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Format a timestamp the way events carry it on the wire:
/// ISO-8601, microsecond precision, explicit `+00:00` offset.
#[must_use]
pub fn format_event_time(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Per-sensor clock whose readings never go backwards.
///
/// Wall-clock adjustments must not reorder events of one sensor, so each
/// reading is clamped to the previous one.
#[derive(Debug, Default, Clone)]
pub struct MonotonicClock {
    last: Option<Timestamp>,
}

impl MonotonicClock {
    /// Stamp `candidate`, clamping it to the last returned value.
    pub fn stamp(&mut self, candidate: Timestamp) -> Timestamp {
        let ts = match self.last {
            Some(last) if candidate < last => last,
            _ => candidate,
        };
        self.last = Some(ts);
        ts
    }

    /// Stamp the current time.
    pub fn now(&mut self) -> Timestamp {
        self.stamp(now())
    }
}

/// Serde adapter for the event wire timestamp format.
pub mod event_time {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Timestamp, format_event_time};

    /// Serialize as ISO-8601 with microseconds and offset.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_event_time(ts))
    }

    /// Parse any RFC 3339 timestamp and normalise it to UTC.
    ///
    /// # Errors
    ///
    /// Fails when the string is not RFC 3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        chrono::DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn should_return_current_utc_time() {
        let before = Utc::now();
        let ts = now();
        let after = Utc::now();
        assert!(ts >= before);
        assert!(ts <= after);
    }

    #[test]
    fn should_format_with_microseconds_and_offset() {
        let ts = DateTime::parse_from_rfc3339("2024-05-30T06:25:13.929544+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_event_time(&ts), "2024-05-30T06:25:13.929544+00:00");
    }

    #[test]
    fn should_pad_microseconds_when_whole_second() {
        let ts = DateTime::parse_from_rfc3339("2024-05-30T06:25:13Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_event_time(&ts), "2024-05-30T06:25:13.000000+00:00");
    }

    #[test]
    fn should_never_go_backwards() {
        let mut clock = MonotonicClock::default();
        let t0 = now();
        let first = clock.stamp(t0);
        let second = clock.stamp(t0 - TimeDelta::seconds(5));
        assert_eq!(first, t0);
        assert_eq!(second, t0);
    }

    #[test]
    fn should_advance_with_later_candidates() {
        let mut clock = MonotonicClock::default();
        let t0 = now();
        clock.stamp(t0);
        let later = t0 + TimeDelta::milliseconds(10);
        assert_eq!(clock.stamp(later), later);
    }
}
