use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use logscope::{
    context, CrashPersistence, Datum, EventStore, ExportOptions, LogLevel, MemoryStorage,
    ObjectRef, PersistenceConfig, SpanStatus, StoreConfig,
};
use serde_json::{json, Value};

#[test]
fn fifo_cap_keeps_the_most_recent_three() {
    let store = EventStore::new(StoreConfig {
        max_logs: 3,
        ..StoreConfig::default()
    });
    for message in ["1", "2", "3", "4"] {
        store.info(message);
    }

    let messages: Vec<String> = store.logs().into_iter().map(|event| event.message).collect();
    assert_eq!(messages, vec!["2", "3", "4"]);
}

#[test]
fn self_reference_becomes_circular_sentinel() {
    let store = EventStore::default();
    let object = ObjectRef::from_fields([("a", 1)]);
    object.insert("self", object.clone());

    store.info_with("cyclic", vec![Datum::Object(object.clone())]);
    object.clear();

    let data = serde_json::to_value(&store.logs()[0].data[0]).unwrap();
    assert_eq!(data, json!({"a": 1, "self": "[Circular Reference]"}));
}

#[test]
fn checkout_span_collects_its_log() {
    let store = EventStore::default();
    let span = store.start_span("checkout", None, None);
    span.info("card charged");
    span.end();

    let recorded = store.span(span.id()).unwrap();
    assert_eq!(recorded.status, SpanStatus::Success);
    assert!(recorded.duration.unwrap() >= 0);
    assert_eq!(store.span_logs(span.id()).len(), 1);
}

#[test]
fn bound_logger_merges_global_context() {
    let store = EventStore::default();
    store.set_global_context(context! { "env" => "dev" });
    store
        .with_context(context! { "requestId" => "r1" })
        .info("request handled");

    let event = store.logs().pop().unwrap();
    assert_eq!(
        serde_json::to_value(event.context).unwrap(),
        json!({"env": "dev", "requestId": "r1"})
    );
}

#[test]
fn unclean_shutdown_is_detected_and_rehydrated() {
    let storage = Arc::new(MemoryStorage::new());
    {
        let crashed = EventStore::default();
        let bridge =
            CrashPersistence::new(crashed.clone(), storage.clone(), PersistenceConfig::default());
        assert!(bridge.enable());
        crashed.info("first");
        crashed.error("second");
        assert!(bridge.flush());
        // No shutdown: the liveness marker stays behind.
    }

    let store = EventStore::default();
    let bridge = CrashPersistence::new(store.clone(), storage, PersistenceConfig::default());
    assert!(bridge.enable());
    assert!(bridge.had_crash());
    assert_eq!(bridge.rehydrate(), 2);
    assert_eq!(store.logs().len(), 2);
}

#[test]
fn export_filters_by_level_and_search() {
    let store = EventStore::default();
    store.warn("upstream timeout after 30s");
    store.info("timeout budget configured");
    store.error("disk full");

    let exported = store.export(
        &ExportOptions::json()
            .levels([LogLevel::Warn, LogLevel::Error])
            .search("timeout"),
    );
    let records: Vec<Value> = serde_json::from_str(&exported).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0]["message"].as_str().unwrap().contains("timeout"));
}

#[test]
fn throwing_subscribers_do_not_starve_others() {
    let store = EventStore::default();
    let calls = Arc::new(AtomicUsize::new(0));
    for index in 0..4 {
        let calls = calls.clone();
        store.subscribe(move |_| {
            if index % 2 == 0 {
                panic!("subscriber {} failed", index);
            }
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    for _ in 0..3 {
        store.info("fan-out");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(store.len(), 3);
}

#[test]
fn import_of_own_snapshot_never_duplicates() {
    let snapshot_source = EventStore::default();
    snapshot_source.info("a");
    snapshot_source.warn("b");

    let copy = EventStore::default();
    copy.import_logs(snapshot_source.logs());
    copy.import_logs(snapshot_source.logs());
    assert_eq!(copy.len(), 2);
}
