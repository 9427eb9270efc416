//! Ports: the traits adapter crates implement.
//!
//! Serial, MQTT and WebSocket adapters plug in here; the sensor tasks, the
//! registry and the dispatcher only ever see these traits.

pub mod event_bus;
pub mod sink;
pub mod transport;

pub use event_bus::EventPublisher;
pub use sink::{EventSink, SinkError};
pub use transport::{BoxTransport, Transport, TransportOpener};
