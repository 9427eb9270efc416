//! [`EventSink`] publishing event JSON to one MQTT topic.

use std::sync::Arc;

use sensord_app::ports::{EventSink, SinkError};
use sensord_domain::event::Event;

use crate::broker::MqttBroker;

/// One sensor-to-topic binding on a shared broker connection.
#[derive(Clone, Debug)]
pub struct MqttSink {
    broker: Arc<MqttBroker>,
    topic: String,
}

impl MqttSink {
    pub fn new(broker: Arc<MqttBroker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl EventSink for MqttSink {
    fn name(&self) -> String {
        format!("mqtt:{}/{}", self.broker.name(), self.topic)
    }

    async fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        let payload = event.to_json()?;
        self.broker
            .publish(&self.topic, payload.into_bytes())
            .map_err(|err| {
                let reason = std::error::Error::source(&err)
                    .map_or_else(|| err.to_string(), ToString::to_string);
                SinkError::Unavailable(reason)
            })
    }
}
