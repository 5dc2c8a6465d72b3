//! Invalidation consumer.
//!
//! Consumes events from the queue and applies them to the registered caches.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::EventQueue;
use super::object::EventDrivenObjectCache;
use super::output::TieredOutputCache;
use super::planner::InvalidationPlan;
use super::translate::EventPathTranslator;

const METRIC_CONSUME_MS: &str = "fragcache_consume_ms";

/// A cache that drops entries by event id.
pub trait EventSink<E>: Send + Sync {
    /// Returns the number of entries removed.
    fn handle_event(&self, event: &E) -> usize;
}

/// A cache that is flushed wholesale on any content change.
pub trait OutputSink: Send + Sync {
    fn invalidate_all(&self);
}

impl<K, V, E> EventSink<E> for EventDrivenObjectCache<K, V, E>
where
    K: Hash + Eq + fmt::Debug + Send + Sync,
    V: Send + Sync,
    E: Hash + Eq + Clone + fmt::Debug + Send + Sync,
{
    fn handle_event(&self, event: &E) -> usize {
        EventDrivenObjectCache::handle_event(self, event)
    }
}

impl<K, V> OutputSink for TieredOutputCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn invalidate_all(&self) {
        TieredOutputCache::invalidate_all(self);
    }
}

/// Outcome of one consumption batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    /// Events drained from the queue, duplicates included.
    pub drained: usize,
    /// Object-cache entries removed across all event sinks.
    pub evicted: usize,
    /// Output sinks flushed.
    pub flushed: usize,
}

/// Cache consumer that processes events and keeps caches consistent.
///
/// The consumer:
/// 1. Drains up to `consume_batch_limit` events from the queue
/// 2. Generates an invalidation plan from the events
/// 3. Executes the plan (object caches by event id, then output flushes)
pub struct InvalidationConsumer<E> {
    batch_limit: usize,
    queue: Arc<EventQueue<E>>,
    translator: Option<Arc<dyn EventPathTranslator<E>>>,
    event_sinks: Vec<Arc<dyn EventSink<E>>>,
    output_sinks: Vec<Arc<dyn OutputSink>>,
}

impl<E> InvalidationConsumer<E>
where
    E: Hash + Eq + Clone + fmt::Debug,
{
    pub fn new(config: &CacheConfig, queue: Arc<EventQueue<E>>) -> Self {
        Self {
            batch_limit: config.consume_batch_limit.max(1),
            queue,
            translator: None,
            event_sinks: Vec::new(),
            output_sinks: Vec::new(),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn EventPathTranslator<E>>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink<E>>) -> Self {
        self.event_sinks.push(sink);
        self
    }

    pub fn with_output_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output_sinks.push(sink);
        self
    }

    /// Consume one batch of pending events and execute its plan.
    ///
    /// Returns `None` when the queue was empty.
    #[instrument(skip(self))]
    pub fn consume(&self) -> Option<ConsumeReport> {
        let consume_started_at = Instant::now();
        let events = self.queue.drain(self.batch_limit);
        if events.is_empty() {
            return None;
        }

        let drained = events.len();
        let plan = InvalidationPlan::from_events(events, self.translator.as_deref());
        let event_ids: &[Uuid] = &plan.event_ids;

        info!(
            event_count = drained,
            event_ids = ?event_ids,
            plan = %plan,
            "Cache consumption starting"
        );

        let mut report = ConsumeReport {
            drained,
            ..Default::default()
        };

        // Phase 1: object caches, by event id
        for event in &plan.events {
            for sink in &self.event_sinks {
                report.evicted += sink.handle_event(event);
            }
            debug!(event = ?event, "Applied event to object caches");
        }

        // Phase 2: output caches
        if plan.flush_output {
            for sink in &self.output_sinks {
                sink.invalidate_all();
                report.flushed += 1;
            }
        }

        info!(
            event_count = drained,
            evicted = report.evicted,
            flushed = report.flushed,
            "Cache consumption complete"
        );

        histogram!(METRIC_CONSUME_MS).record(consume_started_at.elapsed().as_secs_f64() * 1000.0);

        Some(report)
    }

    /// Consume batches until the queue is empty.
    ///
    /// Returns the combined report of every batch.
    #[instrument(skip(self))]
    pub fn consume_all(&self) -> ConsumeReport {
        let mut total = ConsumeReport::default();
        while let Some(report) = self.consume() {
            total.drained += report.drained;
            total.evicted += report.evicted;
            total.flushed += report.flushed;
        }
        total
    }

    /// Get reference to the event queue.
    pub fn queue(&self) -> &Arc<EventQueue<E>> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::events::InvalidationSignal;

    #[derive(Default)]
    struct CountingOutput {
        flushes: AtomicUsize,
    }

    impl OutputSink for CountingOutput {
        fn invalidate_all(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn queue() -> Arc<EventQueue<String>> {
        Arc::new(EventQueue::new(NonZeroUsize::new(64).expect("non-zero")))
    }

    #[test]
    fn consume_empty_queue_returns_none() {
        let consumer = InvalidationConsumer::new(&CacheConfig::default(), queue());
        assert!(consumer.consume().is_none());
    }

    #[test]
    fn consume_processes_events() {
        let objects: Arc<EventDrivenObjectCache<String, String, String>> =
            Arc::new(EventDrivenObjectCache::new());
        let output = Arc::new(CountingOutput::default());
        let consumer = InvalidationConsumer::new(&CacheConfig::default(), queue())
            .with_event_sink(objects.clone())
            .with_output_sink(output.clone());

        let _kept = objects.put("k".to_string(), "v".to_string(), ["news".to_string()]);
        consumer
            .queue()
            .publish(InvalidationSignal::Event("news".to_string()));
        consumer.queue().publish(InvalidationSignal::ContainerRefreshed);

        let report = consumer.consume().expect("events pending");
        assert_eq!(report.drained, 2);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.flushed, 1);
        assert!(consumer.queue().is_empty());
        assert!(objects.get(&"k".to_string()).is_none());
        assert_eq!(output.flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn consume_respects_batch_limit() {
        let config = CacheConfig {
            consume_batch_limit: 2,
            ..Default::default()
        };
        let consumer = InvalidationConsumer::new(&config, queue());

        for _ in 0..5 {
            consumer.queue().publish(InvalidationSignal::FlushAll);
        }

        assert_eq!(consumer.queue().len(), 5);
        consumer.consume();
        assert_eq!(consumer.queue().len(), 3); // Only consumed 2

        let total = consumer.consume_all();
        assert_eq!(total.drained, 3);
        assert!(consumer.queue().is_empty());
    }
}
