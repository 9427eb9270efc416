//! Local event fan-out for in-process subscribers (`sensorctl events`).
//!
//! Backed by a tokio [`broadcast`] channel: a subscriber that falls behind
//! skips the oldest events instead of slowing sensors down.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use sensord_domain::event::Event;

use crate::ports::EventPublisher;

pub struct InProcessEventBus {
    sender: broadcast::Sender<Event>,
}

impl InProcessEventBus {
    /// `capacity` bounds how far a subscriber may fall behind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            skipped: 0,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for InProcessEventBus {
    async fn publish(&self, event: Event) -> usize {
        // Only fails when nobody is subscribed.
        self.sender.send(event).unwrap_or(0)
    }
}

/// One subscriber's stream of events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    skipped: u64,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(count)) => {
                    self.skipped += count;
                    tracing::warn!(skipped = count, "event subscriber lagging, events skipped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events lost so far because this subscriber lagged.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensord_domain::sensor::{SensorId, SensorKind};
    use sensord_domain::time::now;

    fn event(name: &str) -> Event {
        Event::presence_change(SensorId::new(SensorKind::Sen0395, name), true, now())
    }

    #[tokio::test]
    async fn should_reach_every_subscriber() {
        let bus = InProcessEventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(event("desk")).await, 2);

        assert_eq!(first.next().await.unwrap().sensor_id.name, "desk");
        assert_eq!(second.next().await.unwrap().sensor_id.name, "desk");
    }

    #[tokio::test]
    async fn should_discard_event_without_subscribers() {
        let bus = InProcessEventBus::new(16);
        assert_eq!(bus.publish(event("desk")).await, 0);

        let mut late = bus.subscribe();
        bus.publish(event("hall")).await;
        assert_eq!(late.next().await.unwrap().sensor_id.name, "hall");
    }

    #[tokio::test]
    async fn should_skip_oldest_events_when_lagging() {
        let bus = InProcessEventBus::new(2);
        let mut slow = bus.subscribe();
        for name in ["a", "b", "c", "d"] {
            bus.publish(event(name)).await;
        }

        assert_eq!(slow.next().await.unwrap().sensor_id.name, "c");
        assert_eq!(slow.skipped(), 2);
        assert_eq!(slow.next().await.unwrap().sensor_id.name, "d");
    }

    #[tokio::test]
    async fn should_end_when_bus_is_dropped() {
        let bus = InProcessEventBus::new(4);
        let mut subscription = bus.subscribe();
        drop(bus);
        assert!(subscription.next().await.is_none());
    }
}
