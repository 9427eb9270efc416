//! MQTT adapter error types.

use sensord_domain::error::SensordError;

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// A sensor binding names a broker that is not configured.
    #[error("unknown MQTT broker {0}")]
    UnknownBroker(String),

    /// A sensor binding names a broker that is disabled.
    #[error("MQTT broker {0} is disabled")]
    BrokerDisabled(String),

    /// The rumqttc client returned an error.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// The event could not be encoded as JSON.
    #[error("failed to encode MQTT payload")]
    Payload(#[source] serde_json::Error),
}

impl MqttError {
    /// Convert into a [`SensordError::Transport`] for propagation across
    /// port boundaries.
    pub fn into_domain(self) -> SensordError {
        SensordError::transport(self)
    }
}

impl From<MqttError> for SensordError {
    fn from(err: MqttError) -> Self {
        err.into_domain()
    }
}
