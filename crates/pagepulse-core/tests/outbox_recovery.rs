//! Durable teardown outbox: a teardown whose flush never lands is picked up
//! by the next pipeline of the same session.

mod common;

use std::sync::Arc;

use pagepulse_core::outbox::Outbox;
use pagepulse_core::session::MemorySessionStore;
use pagepulse_core::{
    FlushOutcome, FlushReason, LifecycleSignal, MemorySink, PipelineConfig, SkipReason,
};

use common::{Harness, enabled_config};

fn outbox_config(dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        outbox_dir: Some(dir.to_path_buf()),
        ..enabled_config(50)
    }
}

#[tokio::test]
async fn failed_teardown_is_recovered_by_next_pipeline() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = MemorySessionStore::new();

    let failing = MemorySink::new();
    failing.fail_always(true);
    let first = Harness::with_store(failing, outbox_config(tmp.path()), store.clone());
    first.sign_in("u1");
    first.track("checkout");
    let outcome = first.pipeline.dispatch(LifecycleSignal::PageHide).await;
    assert!(matches!(outcome, Some(FlushOutcome::Failed { .. })));

    let path = first.pipeline.outbox_path().unwrap();
    assert!(path.exists());

    let sink = MemorySink::new();
    let second = Harness::with_store(sink.clone(), outbox_config(tmp.path()), store);
    assert_eq!(second.session_id(), first.session_id());
    assert_eq!(second.pipeline.recover_outbox(), 2);
    assert!(!path.exists());

    second.sign_in("u1");
    assert_eq!(
        second.pipeline.flush(FlushReason::Manual).await,
        FlushOutcome::Committed { events: 2 }
    );
    assert_eq!(
        sink.event_types(&second.session_id()),
        vec!["checkout", "page_time"]
    );
}

#[tokio::test]
async fn committed_teardown_clears_outbox() {
    let tmp = tempfile::TempDir::new().unwrap();
    let h = Harness::with_config(MemorySink::new(), outbox_config(tmp.path()));
    h.sign_in("u1");
    h.track("a");

    let outcome = h.pipeline.dispatch(LifecycleSignal::PageHide).await;
    assert_eq!(outcome, Some(FlushOutcome::Committed { events: 2 }));
    assert!(!h.pipeline.outbox_path().unwrap().exists());
    assert_eq!(h.pipeline.recover_outbox(), 0);
}

#[tokio::test]
async fn later_commit_clears_outbox_after_failed_teardown() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sink = MemorySink::new();
    sink.fail_next(1);
    let h = Harness::with_config(sink.clone(), outbox_config(tmp.path()));
    h.sign_in("u1");
    h.track("a");

    let outcome = h.pipeline.dispatch(LifecycleSignal::PageHide).await;
    assert!(matches!(outcome, Some(FlushOutcome::Failed { .. })));
    let path = h.pipeline.outbox_path().unwrap();
    assert!(path.exists());

    assert_eq!(
        h.pipeline.flush(FlushReason::Manual).await,
        FlushOutcome::Committed { events: 2 }
    );
    assert!(!path.exists());
    assert_eq!(sink.event_types(&h.session_id()), vec!["a", "page_time"]);
}

#[tokio::test]
async fn stale_commit_keeps_newer_teardown_write() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (sink, gate) = MemorySink::paused();
    let h = Harness::with_config(sink, outbox_config(tmp.path()));
    h.sign_in("u1");
    h.track("a");
    assert_eq!(
        h.pipeline.apply_signal(LifecycleSignal::PageHide),
        Some(FlushReason::Pagehide)
    );

    // This flush drains the first teardown's events and parks in the sink.
    let pipeline = Arc::clone(&h.pipeline);
    let first = tokio::spawn(async move { pipeline.flush(FlushReason::Manual).await });
    for _ in 0..10_000 {
        if h.pipeline.is_flush_in_flight() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(h.pipeline.is_flush_in_flight());

    h.track("b");
    assert_eq!(
        h.pipeline.dispatch(LifecycleSignal::PageHide).await,
        Some(FlushOutcome::Skipped(SkipReason::InFlight))
    );

    gate.notify_one();
    assert_eq!(first.await.unwrap(), FlushOutcome::Committed { events: 2 });

    let path = h.pipeline.outbox_path().unwrap();
    assert!(path.exists());
    let saved: Vec<String> = Outbox::new(tmp.path())
        .take(&h.session_id())
        .unwrap()
        .iter()
        .map(|event| event.type_tag().to_string())
        .collect();
    assert_eq!(saved, vec!["b", "page_time"]);
}

#[tokio::test]
async fn corrupt_outbox_is_discarded() {
    let tmp = tempfile::TempDir::new().unwrap();
    let h = Harness::with_config(MemorySink::new(), outbox_config(tmp.path()));
    let path = h.pipeline.outbox_path().unwrap();
    std::fs::write(&path, b"garbage").unwrap();

    assert_eq!(h.pipeline.recover_outbox(), 0);
    assert!(!path.exists());
    assert_eq!(h.pipeline.queue_len(), 0);
}

#[tokio::test]
async fn without_outbox_dir_nothing_is_written() {
    let h = Harness::new(MemorySink::new());
    h.sign_in("u1");
    h.pipeline.apply_signal(LifecycleSignal::PageHide);
    assert!(h.pipeline.outbox_path().is_none());
    assert_eq!(h.pipeline.recover_outbox(), 0);
}
