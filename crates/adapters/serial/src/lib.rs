//! # sensord-adapter-serial
//!
//! Serial adapter: opens the serial port of each sensor.
//!
//! ## Responsibilities
//! - Implement the `TransportOpener` port with `serialport`
//! - Bridge the blocking port into an async byte stream: one thread reads
//!   the port, one writes it, and a tokio task moves bytes between those
//!   threads and an in-memory duplex handed to the sensor instance
//!
//! ## Dependency rule
//! Depends on `sensord-app` (for port traits) and `sensord-domain` (for
//! domain types). Never depended upon by app or domain.

mod bridge;
pub mod error;

use std::time::Duration;

use sensord_app::ports::{BoxTransport, TransportOpener};
use sensord_domain::error::SensordError;
use sensord_domain::sensor::SensorConfig;

use crate::error::SerialError;

/// Opens serial ports for sensor instances.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    /// How long a blocking read waits before checking whether the sensor
    /// instance is still there.
    pub read_timeout: Duration,
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl SerialOpener {
    async fn open_port(
        &self,
        config: &SensorConfig,
        baud_rate: u32,
    ) -> Result<BoxTransport, SerialError> {
        let path = config.transport.clone();
        let timeout = self.read_timeout;
        let port = tokio::task::spawn_blocking({
            let path = path.clone();
            move || serialport::new(path, baud_rate).timeout(timeout).open()
        })
        .await
        .map_err(SerialError::Join)?
        .map_err(|source| SerialError::Open {
            path: path.clone(),
            source,
        })?;
        let writer = port.try_clone().map_err(SerialError::Clone)?;
        tracing::debug!(sensor = %config.id(), %path, baud_rate, "serial port opened");
        let stream = bridge::spawn(&config.name, port, writer)?;
        Ok(Box::new(stream))
    }
}

impl TransportOpener for SerialOpener {
    async fn open(
        &self,
        config: &SensorConfig,
        baud_rate: u32,
    ) -> Result<BoxTransport, SensordError> {
        self.open_port(config, baud_rate)
            .await
            .map_err(SerialError::into_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensord_domain::sensor::SensorKind;

    #[tokio::test]
    async fn should_fail_to_open_missing_port() {
        let config = SensorConfig::new(
            "attic",
            SensorKind::Sen0311,
            "/dev/sensord-test-missing-port",
        );
        let Err(err) = SerialOpener::default().open(&config, 9600).await else {
            panic!("missing port must not open");
        };
        assert!(matches!(err, SensordError::Transport(_)));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("unable to open serial port /dev/sensord-test-missing-port")
        );
    }
}
