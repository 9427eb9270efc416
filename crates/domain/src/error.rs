//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into
//! [`SensordError`] at port boundaries.

/// Base error for everything that crosses a port boundary.
#[derive(Debug, thiserror::Error)]
pub enum SensordError {
    /// A domain invariant was violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// The addressed sensor (or any sensor at all) does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// The underlying transport or network layer failed.
    #[error("transport error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A domain invariant that failed to hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A name field was empty.
    #[error("name must not be empty")]
    EmptyName,

    /// Two sensors were configured with the same name.
    #[error("sensor {0} is already registered")]
    DuplicateSensor(String),

    /// Presence threshold lies above the absence threshold.
    #[error("threshold_presence ({presence}) must not exceed threshold_absence ({absence})")]
    ThresholdOrder {
        /// Configured presence threshold (cm).
        presence: u32,
        /// Configured absence threshold (cm).
        absence: u32,
    },

    /// Hysteresis count must be at least one sample.
    #[error("hysteresis_count must be at least 1")]
    ZeroHysteresis,

    /// A command argument was missing or out of range.
    #[error("invalid argument for {command}: {reason}")]
    InvalidArgument {
        /// The command whose arguments failed.
        command: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Lookup failure for a sensor (or an empty registry).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotFoundError {
    /// No sensor registered under this name.
    #[error("sensor {0} not found")]
    Sensor(String),

    /// The registry (or the addressed device family) has no sensors.
    #[error("no sensors found")]
    NoSensors,
}

impl SensordError {
    /// Wrap any error as a transport failure.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_convert_validation_error_with_from() {
        let err: SensordError = ValidationError::EmptyName.into();
        assert!(matches!(err, SensordError::Validation(ValidationError::EmptyName)));
    }

    #[test]
    fn should_convert_not_found_error_with_from() {
        let err: SensordError = NotFoundError::Sensor("desk".to_string()).into();
        assert!(matches!(err, SensordError::NotFound(_)));
    }

    #[test]
    fn should_display_not_found_sensor() {
        let err = NotFoundError::Sensor("desk".to_string());
        assert_eq!(err.to_string(), "sensor desk not found");
    }

    #[test]
    fn should_display_threshold_order() {
        let err = ValidationError::ThresholdOrder {
            presence: 200,
            absence: 100,
        };
        assert_eq!(
            err.to_string(),
            "threshold_presence (200) must not exceed threshold_absence (100)"
        );
    }

    #[test]
    fn should_keep_source_of_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such port");
        let err = SensordError::transport(io);
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("no such port"));
    }
}
