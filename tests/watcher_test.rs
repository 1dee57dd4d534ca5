//! Watcher Integration Tests
//!
//! Watchers through the façade: event kinds per operation, pattern
//! matching, error isolation with auto-disable, and the global stream.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use shaledb::{EventKind, Value};

/// Each operation dispatches its own event kind with the right payload.
#[tokio::test]
async fn event_kinds_per_operation() {
    let (_dir, db) = common::open_table_db("kinds.db", common::unbatched()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    db.watch("*", move |event| {
        sink.lock()
            .unwrap()
            .push((event.event, event.key.clone(), event.value.clone()));
        Ok(())
    })
    .unwrap();

    db.set("k", 1).await.unwrap();
    db.push("list", "a").await.unwrap();
    db.pull("list", "a").await.unwrap();
    db.add("n", 5.0).await.unwrap();
    db.subtract("n", 2.0).await.unwrap();
    db.delete("k").await.unwrap();
    db.clear().await.unwrap();

    let seen = seen.lock().unwrap();
    let kinds: Vec<EventKind> = seen.iter().map(|(kind, _, _)| *kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Set,
            EventKind::Push,
            EventKind::Pull,
            EventKind::Add,
            EventKind::Subtract,
            EventKind::Delete,
            EventKind::Clear,
        ]
    );

    // The add event carries the new number.
    let (_, key, value) = &seen[3];
    assert_eq!(key, "n");
    assert_eq!(value, &Value::Number(5.0));
}

/// Only watchers whose pattern matches the key fire.
#[tokio::test]
async fn pattern_scoping() {
    let (_dir, db) = common::open_table_db("patterns.db", common::unbatched()).await;

    let user_count = Arc::new(AtomicUsize::new(0));
    let order_count = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&user_count);
    db.watch("user:*", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    let counter = Arc::clone(&order_count);
    db.watch("order:1", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    db.set("user:1", 1).await.unwrap();
    db.set("user:2", 2).await.unwrap();
    db.set("order:1", 3).await.unwrap();
    db.set("order:2", 4).await.unwrap();

    assert_eq!(user_count.load(Ordering::SeqCst), 2);
    assert_eq!(order_count.load(Ordering::SeqCst), 1);
}

/// A throwing watcher never disturbs the caller or other watchers, and is
/// silently disabled after ten consecutive errors.
#[tokio::test]
async fn error_isolation_and_auto_disable() {
    let (_dir, db) = common::open_table_db("errors.db", common::unbatched()).await;
    let mut error_reports = db.error_events();

    db.watch("*", |_| Err("callback exploded".into())).unwrap();

    let healthy = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&healthy);
    db.watch("*", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    for i in 0..15 {
        // The failing neighbor never surfaces to the mutating caller.
        db.set("k", i).await.unwrap();
    }

    assert_eq!(healthy.load(Ordering::SeqCst), 15);

    let mut reported = 0;
    while let Ok(report) = error_reports.try_recv() {
        assert!(report.message.contains("exploded"));
        reported += 1;
    }
    assert_eq!(reported, 10, "disabled at the threshold, not before or after");
}

/// unwatch stops delivery; clear_watchers removes everyone.
#[tokio::test]
async fn unwatch_and_clear() {
    let (_dir, db) = common::open_table_db("unwatch.db", common::unbatched()).await;

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let id = db
        .watch("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    db.set("a", 1).await.unwrap();
    assert!(db.unwatch(id));
    db.set("b", 2).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    db.watch("*", |_| Ok(())).unwrap();
    assert_eq!(db.watcher_count(), 1);
    db.clear_watchers();
    assert_eq!(db.watcher_count(), 0);
}

/// The global stream sees every mutation with old and new values.
#[tokio::test]
async fn global_stream_carries_old_values() {
    let (_dir, db) = common::open_table_db("stream.db", common::unbatched()).await;
    let mut events = db.subscribe();

    db.set("k", 1).await.unwrap();
    db.set("k", 2).await.unwrap();
    db.delete("k").await.unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.event, EventKind::Set);
    assert_eq!(first.old_value, None);

    let second = events.recv().await.unwrap();
    assert_eq!(second.value, Value::Number(2.0));
    assert_eq!(second.old_value, Some(Value::Number(1.0)));

    let third = events.recv().await.unwrap();
    assert_eq!(third.event, EventKind::Delete);
    assert_eq!(third.old_value, Some(Value::Number(2.0)));
    assert!(third.timestamp_ms > 0);
}
