//! Event dispatcher: fans events out to sinks with per-sink isolation.
//!
//! Every sink gets its own bounded backlog and worker task. Publishing only
//! enqueues, so a slow or unreachable sink never delays sensors or other
//! sinks. When a backlog is full the oldest queued event is dropped: events
//! describe current state, and the newest one must survive.
//!
//! Local subscribers receive every published event through the in-process
//! [`InProcessEventBus`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use sensord_domain::event::Event;

use crate::event_bus::{InProcessEventBus, Subscription};
use crate::ports::{EventPublisher, EventSink};

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Events queued per sink before the oldest is dropped.
    pub backlog_capacity: usize,
    /// Capacity of the local subscriber channel.
    pub local_capacity: usize,
    /// How long shutdown waits for sinks to flush their backlog.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            backlog_capacity: 64,
            local_capacity: 256,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Delivery counters of one sink.
#[derive(Debug, Default)]
struct SinkStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of a sink's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug)]
struct Backlog {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl Backlog {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Push `event`, returning whether an older event had to be dropped.
    fn push(&self, event: Event) -> bool {
        let dropped = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Event> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cheap, cloneable handle to one running sink worker.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    name: Arc<str>,
    backlog: Arc<Backlog>,
    stats: Arc<SinkStats>,
}

impl SinkHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current delivery counters.
    #[must_use]
    pub fn stats(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Events waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    fn enqueue(&self, event: Event) {
        if self.backlog.is_closed() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.backlog.push(event) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(sink = %self.name, "backlog full, dropped oldest event");
        }
    }
}

async fn run_worker<S: EventSink>(sink: S, backlog: Arc<Backlog>, stats: Arc<SinkStats>) {
    let name = sink.name();
    loop {
        if let Some(event) = backlog.pop() {
            match sink.deliver(&event).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sink = %name, sensor = %event.sensor_id, %err, "event delivery failed");
                }
            }
        } else if backlog.is_closed() {
            break;
        } else {
            backlog.notify.notified().await;
        }
    }
    tracing::debug!(sink = %name, "sink worker stopped");
}

/// Fans events out to sink workers and local subscribers.
pub struct EventDispatcher {
    settings: DispatcherSettings,
    local: InProcessEventBus,
    workers: Mutex<Vec<(SinkHandle, JoinHandle<()>)>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(settings: DispatcherSettings) -> Self {
        let local = InProcessEventBus::new(settings.local_capacity);
        Self {
            settings,
            local,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start a worker for `sink` and return the handle sensors publish to.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sink<S: EventSink>(&self, sink: S) -> SinkHandle {
        let handle = SinkHandle {
            name: Arc::from(sink.name()),
            backlog: Arc::new(Backlog::new(self.settings.backlog_capacity)),
            stats: Arc::new(SinkStats::default()),
        };
        tracing::debug!(sink = %handle.name, "starting sink worker");
        let task = tokio::spawn(run_worker(
            sink,
            Arc::clone(&handle.backlog),
            Arc::clone(&handle.stats),
        ));
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle.clone(), task));
        handle
    }

    /// Queue `event` on every sink in `sinks` and forward it to local
    /// subscribers. Never waits for delivery.
    pub async fn publish(&self, event: Event, sinks: &[SinkHandle]) {
        for sink in sinks {
            sink.enqueue(event.clone());
        }
        let receivers = self.local.publish(event).await;
        tracing::trace!(receivers, "event offered to local subscribers");
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.local.subscribe()
    }

    /// Handles of all running sinks.
    #[must_use]
    pub fn sinks(&self) -> Vec<SinkHandle> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Stop accepting events, let workers flush within the grace period,
    /// then abort whatever is left.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (handle, _) in &workers {
            handle.backlog.close();
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(workers.len());
        let mut handles = Vec::with_capacity(workers.len());
        for (handle, task) in workers {
            handles.push(handle);
            tasks.push(task);
        }

        let flush = async {
            for task in &mut tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.settings.shutdown_grace, flush)
            .await
            .is_err()
        {
            tracing::warn!("sink flush grace period elapsed, aborting remaining deliveries");
            for task in &tasks {
                task.abort();
            }
        }

        for handle in &handles {
            let stats = handle.stats();
            tracing::info!(
                sink = %handle.name,
                delivered = stats.delivered,
                failed = stats.failed,
                dropped = stats.dropped + handle.pending() as u64,
                "sink stopped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SinkError;
    use crate::testing::ChannelSink;
    use sensord_domain::sensor::{SensorId, SensorKind};
    use sensord_domain::time::now;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn name(&self) -> String {
            "failing".to_string()
        }

        async fn deliver(&self, _event: &Event) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("broker unreachable".to_string()))
        }
    }

    struct StalledSink;

    impl EventSink for StalledSink {
        fn name(&self) -> String {
            "stalled".to_string()
        }

        async fn deliver(&self, _event: &Event) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn event(name: &str, present: bool) -> Event {
        Event::presence_change(SensorId::new(SensorKind::Sen0395, name), present, now())
    }

    #[tokio::test]
    async fn should_deliver_event_to_every_sink() {
        let dispatcher = EventDispatcher::new(DispatcherSettings::default());
        let (first, mut rx1) = ChannelSink::new("first");
        let (second, mut rx2) = ChannelSink::new("second");
        let sinks = vec![dispatcher.spawn_sink(first), dispatcher.spawn_sink(second)];

        dispatcher.publish(event("desk", false), &sinks).await;

        assert_eq!(rx1.recv().await.unwrap().sensor_id.name, "desk");
        assert_eq!(rx2.recv().await.unwrap().sensor_id.name, "desk");
    }

    #[tokio::test]
    async fn should_isolate_failing_sink() {
        let dispatcher = EventDispatcher::new(DispatcherSettings::default());
        let failing = dispatcher.spawn_sink(FailingSink);
        let (healthy, mut rx) = ChannelSink::new("healthy");
        let healthy = dispatcher.spawn_sink(healthy);
        let sinks = vec![failing.clone(), healthy.clone()];

        dispatcher.publish(event("desk", true), &sinks).await;
        dispatcher.publish(event("desk", false), &sinks).await;

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        dispatcher.shutdown().await;
        assert_eq!(failing.stats().failed, 2);
        assert_eq!(healthy.stats().delivered, 2);
    }

    #[tokio::test]
    async fn should_not_deliver_to_unbound_sinks() {
        let dispatcher = EventDispatcher::new(DispatcherSettings::default());
        let (bound, mut bound_rx) = ChannelSink::new("bound");
        let (other, mut other_rx) = ChannelSink::new("other");
        let bound = dispatcher.spawn_sink(bound);
        let _other = dispatcher.spawn_sink(other);

        dispatcher.publish(event("desk", true), &[bound]).await;
        dispatcher.shutdown().await;

        assert!(bound_rx.recv().await.is_some());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_preserve_order_per_sink() {
        let dispatcher = EventDispatcher::new(DispatcherSettings::default());
        let (sink, mut rx) = ChannelSink::new("ordered");
        let sinks = vec![dispatcher.spawn_sink(sink)];

        for idx in 0..10 {
            dispatcher
                .publish(event(&format!("s{idx}"), true), &sinks)
                .await;
        }
        for idx in 0..10 {
            assert_eq!(rx.recv().await.unwrap().sensor_id.name, format!("s{idx}"));
        }
    }

    #[tokio::test]
    async fn should_drop_oldest_event_when_backlog_full() {
        let dispatcher = EventDispatcher::new(DispatcherSettings {
            backlog_capacity: 2,
            shutdown_grace: Duration::from_millis(10),
            ..DispatcherSettings::default()
        });
        let handle = dispatcher.spawn_sink(StalledSink);
        let sinks = vec![handle.clone()];

        // The first event is taken by the worker and stalls there.
        dispatcher.publish(event("a", true), &sinks).await;
        tokio::task::yield_now().await;
        dispatcher.publish(event("b", true), &sinks).await;
        dispatcher.publish(event("c", true), &sinks).await;
        dispatcher.publish(event("d", true), &sinks).await;

        assert_eq!(handle.pending(), 2);
        assert_eq!(handle.stats().dropped, 1);
        let newest = handle.backlog.pop().unwrap();
        assert_eq!(newest.sensor_id.name, "c");
        assert_eq!(handle.backlog.pop().unwrap().sensor_id.name, "d");
    }

    #[tokio::test]
    async fn should_forward_events_to_local_subscribers() {
        let dispatcher = EventDispatcher::new(DispatcherSettings::default());
        let mut rx = dispatcher.subscribe();

        dispatcher.publish(event("desk", true), &[]).await;

        assert_eq!(rx.next().await.unwrap().sensor_id.name, "desk");
    }

    #[tokio::test(start_paused = true)]
    async fn should_abort_stalled_sink_after_grace_period() {
        let dispatcher = EventDispatcher::new(DispatcherSettings {
            shutdown_grace: Duration::from_millis(100),
            ..DispatcherSettings::default()
        });
        let handle = dispatcher.spawn_sink(StalledSink);
        dispatcher.publish(event("desk", true), &[handle.clone()]).await;
        tokio::task::yield_now().await;

        dispatcher.shutdown().await;

        assert_eq!(handle.stats().delivered, 0);
        assert!(dispatcher.sinks().is_empty());
    }
}
