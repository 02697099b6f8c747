mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use catalog_sync::models::*;
use catalog_sync::resilience::RetryPolicy;
use catalog_sync::storage::PersistenceLayer;
use catalog_sync::sync::{RunControl, SyncOptions};

use common::*;

#[tokio::test(start_paused = true)]
async fn test_lock_conflicts_are_retried_until_the_batch_lands() {
    let graph = InMemoryGraphStore::with_store(test_store()).await;
    graph.conflicts_remaining.store(2, Ordering::SeqCst);
    let layer = PersistenceLayer::new(graph.clone(), 25, 1, RetryPolicy::new(5, Duration::from_millis(500)));

    let started = tokio::time::Instant::now();
    let report = layer
        .save_page(products("p", 10), STORE_ID, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.persisted, 10);
    assert_eq!(graph.batch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(graph.writes.load(Ordering::SeqCst), 10);
    assert_eq!(graph.product_ids().await.len(), 10);
    // Two backoffs of at least 500ms and 1000ms
    assert!(started.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_sku_survives_rewrite_of_existing_product() {
    let graph = InMemoryGraphStore::with_store(test_store()).await;
    let layer = PersistenceLayer::new(graph.clone(), 25, 2, RetryPolicy::new(5, Duration::from_millis(500)));
    let cancel = CancellationToken::new();

    let mut first = product("p1", 10.0);
    first.sku = Some("ORIGINAL".to_string());
    layer.save_page(vec![first], STORE_ID, &cancel).await.unwrap();

    let mut second = product("p1", 12.0);
    second.sku = Some("CHANGED".to_string());
    layer.save_page(vec![second], STORE_ID, &cancel).await.unwrap();

    let stored = graph.snapshot().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored["p1"].sku.as_deref(), Some("ORIGINAL"));
    assert_eq!(stored["p1"].variants[0].price, 12.0);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_transient_conflicts_matches_clean_run() {
    let pages = vec![products("a", 30), products("b", 12)];

    let clean_dir = tempfile::tempdir().unwrap();
    let clean_graph = InMemoryGraphStore::with_store(test_store()).await;
    let clean = harness(
        test_config(clean_dir.path()),
        clean_graph.clone(),
        Arc::new(ScriptedAdapter::new(pages.clone())),
        Arc::new(FakeAi::default()),
    );
    let control = RunControl::new(SyncJob::new(STORE_ID, false));
    clean.engine.run(STORE_ID, SyncOptions::default(), &control).await.unwrap();

    let flaky_dir = tempfile::tempdir().unwrap();
    let flaky_graph = InMemoryGraphStore::with_store(test_store()).await;
    flaky_graph.conflicts_remaining.store(3, Ordering::SeqCst);
    let flaky = harness(
        test_config(flaky_dir.path()),
        flaky_graph.clone(),
        Arc::new(ScriptedAdapter::new(pages)),
        Arc::new(FakeAi::default()),
    );
    let control = RunControl::new(SyncJob::new(STORE_ID, false));
    let outcome = flaky.engine.run(STORE_ID, SyncOptions::default(), &control).await.unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.count_processed, 42);
    assert_eq!(outcome.dropped_batches, 0);
    assert_eq!(flaky_graph.writes.load(Ordering::SeqCst), 42);
    assert_eq!(flaky_graph.snapshot().await, clean_graph.snapshot().await);
}
