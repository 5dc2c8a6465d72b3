use std::collections::HashSet;
use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::sync::Arc;

use fragcache::cache::{
    CacheConfig, EventDrivenObjectCache, EventQueue, FragmentKey, InvalidationConsumer,
    InvalidationSignal, TieredOutputCache,
};
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;

#[test]
#[serial]
fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Output cache hit/miss/compute/uncacheable/evict
    let config = CacheConfig {
        max_entries: 1,
        ..Default::default()
    };
    let output: Arc<TieredOutputCache<FragmentKey, String>> =
        Arc::new(TieredOutputCache::new(&config));
    let first = FragmentKey::for_path("page", "/one");
    let second = FragmentKey::for_path("page", "/two");

    for key in [&first, &first, &second] {
        output
            .get_or_compute(key, || {
                Ok::<_, Infallible>(Some(output.create_entry(key.clone(), key.to_string())))
            })
            .expect("lookup succeeds");
    }
    let private = FragmentKey::for_path("page", "/private");
    output
        .get_or_compute(&private, || {
            Ok::<_, Infallible>(Some(
                output.create_uncacheable_entry(private.clone(), "private".to_string()),
            ))
        })
        .expect("lookup succeeds");

    // Object cache hit/miss/evict
    let objects: Arc<EventDrivenObjectCache<String, String, String>> =
        Arc::new(EventDrivenObjectCache::new());
    assert!(objects.get(&"menu".to_string()).is_none());
    let _menu = objects.put("menu".to_string(), "home".to_string(), ["menus".to_string()]);
    assert!(objects.get(&"menu".to_string()).is_some());

    // Event queue length + drop metrics, consumer latency, invalidation
    let queue = Arc::new(EventQueue::new(NonZeroUsize::new(1).expect("non-zero")));
    let consumer = InvalidationConsumer::new(&config, Arc::clone(&queue))
        .with_event_sink(objects.clone())
        .with_output_sink(output.clone());
    queue.publish(InvalidationSignal::ContainerRefreshed);
    queue.publish(InvalidationSignal::Event("menus".to_string()));
    assert!(consumer.consume().is_some());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "fragcache_output_hit_total",
        "fragcache_output_miss_total",
        "fragcache_output_compute_total",
        "fragcache_output_uncacheable_total",
        "fragcache_output_invalidated_total",
        "fragcache_output_evict_total",
        "fragcache_object_hit_total",
        "fragcache_object_miss_total",
        "fragcache_object_evict_total",
        "fragcache_event_queue_len",
        "fragcache_event_dropped_total",
        "fragcache_consume_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
