//! Cache event system.
//!
//! Defines invalidation signals and a bounded in-memory queue that carries
//! them from writers to the [`InvalidationConsumer`](super::InvalidationConsumer).

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

const METRIC_DROPPED: &str = "fragcache_event_dropped_total";
const METRIC_QUEUE_LEN: &str = "fragcache_event_queue_len";

/// Monotonic epoch for ordering events.
///
/// Each event gets a unique, monotonically increasing epoch number.
pub type Epoch = u64;

/// Something that happened which may invalidate cached data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationSignal<E> {
    /// An event id that object-cache entries may be registered under.
    Event(E),
    /// A repository path changed; translated to an event id when a
    /// translator is configured.
    PathChanged(String),
    /// The configuration container was rebuilt.
    ContainerRefreshed,
    /// Drop all rendered output.
    FlushAll,
}

/// Cache event with idempotency and ordering support.
#[derive(Debug, Clone)]
pub struct CacheEvent<E> {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub signal: InvalidationSignal<E>,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl<E> CacheEvent<E> {
    pub fn new(signal: InvalidationSignal<E>, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            signal,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Bounded in-memory event queue for cache invalidation.
///
/// When full, publishing drops the oldest pending event. Dropped events are
/// counted; consumers that care should treat a non-zero count as a reason to
/// flush everything.
pub struct EventQueue<E> {
    queue: Mutex<VecDeque<CacheEvent<E>>>,
    epoch_counter: AtomicU64,
    limit: NonZeroUsize,
    dropped: AtomicU64,
}

impl<E: std::fmt::Debug> EventQueue<E> {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit,
            dropped: AtomicU64::new(0),
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish a signal to the queue. Returns the event id.
    pub fn publish(&self, signal: InvalidationSignal<E>) -> Uuid {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(signal, epoch);
        let id = event.id;

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            signal = ?event.signal,
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit.get()
            && let Some(oldest) = queue.pop_front()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_DROPPED).increment(1);
            warn!(
                dropped_id = %oldest.id,
                dropped_epoch = oldest.epoch,
                limit = self.limit.get(),
                "Cache event queue full; dropped oldest event"
            );
        }
        queue.push_back(event);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);

        id
    }

    /// Drain up to `limit` events from the queue.
    ///
    /// Returns the events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent<E>> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> NonZeroUsize {
        self.limit
    }

    /// Number of events dropped on overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Clear all events from the queue.
    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn queue(limit: usize) -> EventQueue<&'static str> {
        EventQueue::new(NonZeroUsize::new(limit).expect("non-zero"))
    }

    #[test]
    fn event_creation() {
        let event = CacheEvent::new(InvalidationSignal::Event("news"), 42);

        assert_eq!(event.epoch, 42);
        assert_eq!(event.signal, InvalidationSignal::Event("news"));
        assert!(!event.id.is_nil());
    }

    #[test]
    fn epoch_monotonicity() {
        let queue = queue(8);

        let e1 = queue.next_epoch();
        let e2 = queue.next_epoch();
        let e3 = queue.next_epoch();

        assert!(e1 < e2);
        assert!(e2 < e3);
    }

    #[test]
    fn publish_and_drain() {
        let queue = queue(8);

        queue.publish(InvalidationSignal::Event("a"));
        queue.publish(InvalidationSignal::ContainerRefreshed);
        queue.publish(InvalidationSignal::PathChanged("/content/x".to_string()));

        assert_eq!(queue.len(), 3);

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(queue.len(), 1);

        // Check order (FIFO)
        assert_eq!(events[0].signal, InvalidationSignal::Event("a"));
        assert_eq!(events[1].signal, InvalidationSignal::ContainerRefreshed);
    }

    #[test]
    fn drain_more_than_available() {
        let queue = queue(8);

        queue.publish(InvalidationSignal::FlushAll);

        let events = queue.drain(100);
        assert_eq!(events.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = queue(2);

        queue.publish(InvalidationSignal::Event("first"));
        queue.publish(InvalidationSignal::Event("second"));
        queue.publish(InvalidationSignal::Event("third"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);

        let events = queue.drain(10);
        assert_eq!(events[0].signal, InvalidationSignal::Event("second"));
        assert_eq!(events[1].signal, InvalidationSignal::Event("third"));
    }

    #[test]
    fn clear_queue() {
        let queue = queue(8);

        queue.publish(InvalidationSignal::Event("a"));
        queue.publish(InvalidationSignal::Event("b"));
        assert!(!queue.is_empty());

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn event_queue_recovers_from_poisoned_lock() {
        let queue = queue(8);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(InvalidationSignal::FlushAll);
        assert_eq!(queue.len(), 1);
    }
}
