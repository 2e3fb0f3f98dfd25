//! Queued sector edits against a published snapshot.

mod common;

use common::{flat, rising, FakeMarketData, Harness};
use sectorflow_core::domain::{JobStatus, SectorDefinition};
use sectorflow_core::jobs::JobQueue;
use sectorflow_core::pipeline::RefreshOptions;
use sectorflow_core::snapshot::encode;
use sectorflow_core::storage::{sectors, SectorLockRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Publishes a snapshot with sector alpha = {AAA}.
async fn published(provider: Arc<FakeMarketData>) -> Harness {
    let harness = Harness::new(provider).await;
    sectors::upsert_sector_definition(
        harness.pipeline.pool(),
        &SectorDefinition::new("alpha", "Alpha", ["AAA"]),
    )
    .await
    .unwrap();
    harness
        .pipeline
        .build_snapshot(RefreshOptions::today())
        .await
        .unwrap()
        .unwrap();
    harness
}

#[tokio::test]
async fn add_ticker_seeds_symbol_and_patches_sector() {
    let harness = published(FakeMarketData::with_series([rising("AAA", 12), flat("BBB", 12)])).await;
    let mutations = harness.mutations();

    let id = mutations.enqueue_add_ticker("ALPHA", " bbb ").await.unwrap();
    let job = mutations.queue().wait(&id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.message);
    assert_eq!(job.kind, "sector_add_ticker");
    assert_eq!(job.meta["symbol"], "BBB");

    let snapshot = harness.pipeline.snapshots().load_latest().await.unwrap();
    let alpha = snapshot.sector("alpha").unwrap();
    assert_eq!(alpha.members, vec!["AAA", "BBB"]);
    assert_eq!(alpha.members_detail.len(), 2);
    assert!(snapshot.ticker_metrics.contains_key("BBB"));
    assert_eq!(snapshot.members_count, 2);
}

#[tokio::test]
async fn add_ticker_to_unknown_sector_is_rejected_up_front() {
    let harness = published(FakeMarketData::with_series([rising("AAA", 12)])).await;
    let mutations = harness.mutations();

    assert!(mutations.enqueue_add_ticker("nope", "AAA").await.is_err());
    assert!(mutations.enqueue_add_ticker("alpha", "  ").await.is_err());
}

#[tokio::test]
async fn remove_ticker_keeps_metrics_of_other_sectors() {
    let harness = published(FakeMarketData::with_series([rising("AAA", 12), flat("BBB", 12)])).await;
    let mutations = harness.mutations();
    let id = mutations.enqueue_add_ticker("alpha", "BBB").await.unwrap();
    mutations.queue().wait(&id, WAIT).await.unwrap();

    let id = mutations.enqueue_remove_ticker("alpha", "AAA").await.unwrap();
    let job = mutations.queue().wait(&id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.message);

    let snapshot = harness.pipeline.snapshots().load_latest().await.unwrap();
    assert_eq!(snapshot.sector("alpha").unwrap().members, vec!["BBB"]);
    // Patching never deletes unrelated ticker_metrics entries.
    assert!(snapshot.ticker_metrics.contains_key("AAA"));
    assert_eq!(snapshot.members_count, 1);
}

#[tokio::test]
async fn create_sector_appends_without_touching_existing_ones() {
    let harness = published(FakeMarketData::with_series([rising("AAA", 12), flat("BBB", 12)])).await;
    let before = harness.pipeline.snapshots().load_latest().await.unwrap();
    let mutations = harness.mutations();

    let id = mutations
        .enqueue_create_sector(SectorDefinition::new("Beta", "Beta", ["bbb", "BBB"]))
        .await
        .unwrap();
    let job = mutations.queue().wait(&id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.message);

    let after = harness.pipeline.snapshots().load_latest().await.unwrap();
    assert_eq!((after.sectors_count, after.members_count), (2, 2));
    assert_eq!(after.sector("beta").unwrap().members, vec!["BBB"]);
    assert!(after.generated_at > before.generated_at);

    let alpha_before = serde_json::to_string(before.sector("alpha").unwrap()).unwrap();
    let alpha_after = serde_json::to_string(after.sector("alpha").unwrap()).unwrap();
    assert_eq!(alpha_before, alpha_after);

    let stored = sectors::load_sectors(harness.pipeline.pool()).await.unwrap();
    assert_eq!(stored.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["alpha", "beta"]);
}

#[tokio::test]
async fn patch_without_snapshot_fails_the_job_only() {
    let harness = Harness::new(FakeMarketData::with_series([rising("AAA", 12)])).await;
    sectors::upsert_sector_definition(
        harness.pipeline.pool(),
        &SectorDefinition::new("alpha", "Alpha", ["AAA"]),
    )
    .await
    .unwrap();
    let mutations = harness.mutations();

    let failed = mutations.enqueue_sector_patch("alpha").await.unwrap();
    let job = mutations.queue().wait(&failed, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.message.unwrap().contains("not found"));
    assert!(!harness.pipeline.snapshots().latest_path().exists());

    harness
        .pipeline
        .build_snapshot(RefreshOptions::today())
        .await
        .unwrap()
        .unwrap();
    let ok = mutations.enqueue_sector_patch("alpha").await.unwrap();
    let job = mutations.queue().wait(&ok, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.message.as_deref(), Some("patched alpha"));
}

#[tokio::test]
async fn same_sector_jobs_apply_in_enqueue_order() {
    let harness = published(FakeMarketData::with_series([rising("AAA", 12)])).await;
    let queue = Arc::new(JobQueue::new(harness.pipeline.pool().clone()));
    let locks = Arc::new(SectorLockRegistry::new());
    let counter = Arc::new(AtomicUsize::new(0));
    queue.start();

    let mut ids = Vec::new();
    for label in ["A", "B"] {
        let pipeline = harness.pipeline.clone();
        let locks = locks.clone();
        let counter = counter.clone();
        let id = queue
            .enqueue("sector_patch", serde_json::json!({ "label": label }), async move {
                let _guard = locks.acquire("alpha").await;
                let mut rollup = pipeline.recompute_sector("alpha").await?;
                let seq = counter.fetch_add(1, Ordering::SeqCst) + 1;
                rollup.name = format!("{label}-{seq}");
                pipeline.snapshots().patch(rollup).await?;
                Ok::<_, anyhow::Error>(format!("{label}-{seq}"))
            })
            .await
            .unwrap();
        ids.push(id);
    }

    let a = queue.wait(&ids[0], WAIT).await.unwrap();
    let b = queue.wait(&ids[1], WAIT).await.unwrap();
    assert_eq!(a.message.as_deref(), Some("A-1"));
    assert_eq!(b.message.as_deref(), Some("B-2"));

    let snapshot = harness.pipeline.snapshots().load_latest().await.unwrap();
    assert_eq!(snapshot.sector("alpha").unwrap().name, "B-2");
    assert_eq!(snapshot.sectors_count, 1);
    let on_disk = std::fs::read(harness.pipeline.snapshots().latest_path()).unwrap();
    assert_eq!(on_disk, encode(&snapshot).unwrap());
}
