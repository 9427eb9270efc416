//! Local publish port: how sensor events reach in-process subscribers.

use std::future::Future;

use sensord_domain::event::Event;

/// Hands events to subscribers inside the daemon, such as control-socket
/// event streams.
///
/// Publishing never fails the caller: with nobody listening the event is
/// discarded.
pub trait EventPublisher: Send + Sync {
    /// Offer `event` to every current subscriber and return how many got it.
    fn publish(&self, event: Event) -> impl Future<Output = usize> + Send;
}
