//! Event sink port: one outbound destination for events.

use std::future::Future;

use sensord_domain::event::Event;

/// Delivery failure reported by a sink.
///
/// Sink errors are counted and logged by the dispatcher; they never reach the
/// sensor that produced the event.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The destination is not connected.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The event could not be encoded.
    #[error("unable to encode event")]
    Encode(#[from] serde_json::Error),
}

/// A destination events are delivered to, one at a time, in order.
///
/// Implementations live in adapter crates (MQTT, WebSocket). Each sink is
/// driven by its own dispatcher worker, so `deliver` may take as long as the
/// network needs without stalling sensors or other sinks.
pub trait EventSink: Send + Sync + 'static {
    /// Name used in logs and statistics, e.g. `mqtt:home/sensors/desk`.
    fn name(&self) -> String;

    /// Deliver one event.
    fn deliver(&self, event: &Event) -> impl Future<Output = Result<(), SinkError>> + Send;
}
