//! Broker connections, one per configured broker name.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::error::MqttError;
use crate::sink::MqttSink;

/// Requests buffered by the client while the broker is unreachable.
const REQUEST_CAPACITY: usize = 64;
/// How long shutdown waits for the disconnect to go out.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// A connected (or reconnecting) broker client.
#[derive(Debug)]
pub struct MqttBroker {
    name: String,
    client: AsyncClient,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Create the client and spawn its event loop.
    ///
    /// Must be called from within a tokio runtime. The connection is
    /// established in the background.
    #[must_use]
    pub fn connect(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let driver = tokio::spawn(drive(
            config.name.clone(),
            event_loop,
            Duration::from_millis(config.reconnect_delay_ms),
        ));
        tracing::info!(broker = %config.name, host = %config.host, port = config.port, "MQTT broker configured");
        Self {
            name: config.name.clone(),
            client,
            driver: Mutex::new(Some(driver)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `payload` for publication on `topic`.
    ///
    /// Never waits for the network: when the broker is unreachable and the
    /// request buffer is full, the publication fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::Client`] when the request cannot be queued.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(MqttError::Client)
    }

    /// Send a disconnect and stop the event loop.
    pub async fn shutdown(&self) {
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(broker = %self.name, %err, "MQTT disconnect failed");
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut driver) = driver
            && tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err()
        {
            driver.abort();
        }
        tracing::debug!(broker = %self.name, "MQTT broker closed");
    }
}

async fn drive(name: String, mut event_loop: EventLoop, reconnect_delay: Duration) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(broker = %name, "MQTT connected");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(broker = %name, "MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(broker = %name, %err, "MQTT connection error, reconnecting");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

/// All configured brokers, by name.
#[derive(Default)]
pub struct BrokerRegistry {
    brokers: BTreeMap<String, Option<Arc<MqttBroker>>>,
}

impl BrokerRegistry {
    /// Connect every enabled broker. Disabled brokers are remembered so
    /// bindings to them can be reported as such.
    #[must_use]
    pub fn connect(configs: &[BrokerConfig]) -> Self {
        let brokers = configs
            .iter()
            .map(|config| {
                let broker = config
                    .enabled
                    .then(|| Arc::new(MqttBroker::connect(config)));
                (config.name.clone(), broker)
            })
            .collect();
        Self { brokers }
    }

    /// Sink publishing to `topic` on the broker named `broker`.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::UnknownBroker`] or [`MqttError::BrokerDisabled`]
    /// when the binding cannot be honoured.
    pub fn sink(&self, broker: &str, topic: &str) -> Result<MqttSink, MqttError> {
        match self.brokers.get(broker) {
            Some(Some(client)) => Ok(MqttSink::new(Arc::clone(client), topic)),
            Some(None) => Err(MqttError::BrokerDisabled(broker.to_string())),
            None => Err(MqttError::UnknownBroker(broker.to_string())),
        }
    }

    /// Disconnect every broker.
    pub async fn shutdown(&self) {
        for broker in self.brokers.values().flatten() {
            broker.shutdown().await;
        }
    }
}
