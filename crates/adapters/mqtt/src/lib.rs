//! # sensord-adapter-mqtt
//!
//! MQTT adapter: publishes sensor events to MQTT brokers.
//!
//! ## Responsibilities
//! - Keep one client connection per configured broker name
//! - Drive each connection's event loop and reconnect on failure
//! - Implement the `EventSink` port for every `(broker, topic)` binding
//!
//! ## Dependency rule
//! Same as other adapters: depends on `sensord-app` and `sensord-domain`.

pub mod broker;
pub mod config;
pub mod error;
pub mod sink;

pub use broker::{BrokerRegistry, MqttBroker};
pub use config::BrokerConfig;
pub use error::MqttError;
pub use sink::MqttSink;
