//! Integration tests for the cleanup sweep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use snapq::collab::{ArtifactCleaner, CleanupError, Deleted};
use snapq::engine::{SweepReport, Sweeper};
use snapq::model::work::*;
use snapq::store::Store;
use tokio::sync::watch;

/// Fails for artifacts listed in `broken`; otherwise tracks what it removed.
#[derive(Default)]
struct FakeCleaner {
    broken: HashSet<String>,
    removed: Mutex<HashSet<String>>,
}

#[async_trait]
impl ArtifactCleaner for FakeCleaner {
    async fn delete_artifact(&self, artifact: &ArtifactRef) -> Result<Deleted, CleanupError> {
        if self.broken.contains(artifact.as_str()) {
            return Err(CleanupError("permission denied".into()));
        }
        if self.removed.lock().unwrap().insert(artifact.to_string()) {
            Ok(Deleted::Removed)
        } else {
            Ok(Deleted::NotFound)
        }
    }
}

/// Closes the store on its first call, so every record delete after it fails.
struct ClosingCleaner {
    store: Arc<Store>,
}

#[async_trait]
impl ArtifactCleaner for ClosingCleaner {
    async fn delete_artifact(&self, _artifact: &ArtifactRef) -> Result<Deleted, CleanupError> {
        self.store.close().await;
        Ok(Deleted::Removed)
    }
}

async fn settle(store: &Store, name: &str, to: State) -> WorkItem {
    let item = store
        .put(NewWorkItem::new(ArtifactRef::new(name)))
        .await
        .unwrap();
    let item = store
        .update_state(item.id, State::Pending, StateUpdate::claim(&item))
        .await
        .unwrap();
    let update = match to {
        State::Done => StateUpdate::done(&item, "ok".into()),
        other => StateUpdate::failed(&item, other, "boom"),
    };
    store
        .update_state(item.id, State::InFlight, update)
        .await
        .unwrap()
}

fn hours(n: i64) -> TimeDelta {
    TimeDelta::hours(n)
}

#[tokio::test]
async fn reaps_only_settled_items_past_grace() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let done = settle(&store, "done.png", State::Done).await;
    let dead = settle(&store, "dead.png", State::FailedTerminal).await;
    let retrying = settle(&store, "retry.png", State::FailedRetryable).await;
    let pending = store
        .put(NewWorkItem::new(ArtifactRef::new("pending.png")))
        .await
        .unwrap();

    let cleaner = Arc::new(FakeCleaner::default());
    let sweeper = Sweeper::new(Arc::clone(&store), cleaner.clone(), Duration::from_secs(3600));

    // Inside the grace period nothing is touched.
    let report = sweeper.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(report, SweepReport::default());

    let report = sweeper.sweep_once(Utc::now() + hours(2)).await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(report.failed, 0);

    assert!(store.get(done.id).await.is_err());
    assert!(store.get(dead.id).await.is_err());
    assert!(store.get(retrying.id).await.is_ok());
    assert!(store.get(pending.id).await.is_ok());
    assert_eq!(cleaner.removed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn artifact_failure_keeps_record_for_next_pass() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let ok = settle(&store, "ok.png", State::Done).await;
    let stuck = settle(&store, "stuck.png", State::Done).await;

    let cleaner = Arc::new(FakeCleaner {
        broken: HashSet::from(["stuck.png".to_string()]),
        ..Default::default()
    });
    let sweeper = Sweeper::new(Arc::clone(&store), cleaner, Duration::from_secs(60));

    let report = sweeper.sweep_once(Utc::now() + hours(1)).await.unwrap();
    assert_eq!(report, SweepReport { removed: 1, failed: 1 });
    assert!(store.get(ok.id).await.is_err());
    assert_eq!(store.get(stuck.id).await.unwrap().state, State::Done);
}

#[tokio::test]
async fn record_delete_failure_is_counted_and_pass_continues() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    settle(&store, "a.png", State::Done).await;
    settle(&store, "b.png", State::FailedTerminal).await;

    let cleaner = Arc::new(ClosingCleaner {
        store: Arc::clone(&store),
    });
    let sweeper = Sweeper::new(Arc::clone(&store), cleaner, Duration::ZERO);

    let report = sweeper.sweep_once(Utc::now() + hours(1)).await.unwrap();
    assert_eq!(report, SweepReport { removed: 0, failed: 2 });
}

#[tokio::test]
async fn missing_artifact_still_removes_record() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let item = settle(&store, "gone.png", State::FailedTerminal).await;

    let cleaner = Arc::new(FakeCleaner::default());
    cleaner.removed.lock().unwrap().insert("gone.png".into());
    let sweeper = Sweeper::new(Arc::clone(&store), cleaner, Duration::ZERO);

    let report = sweeper.sweep_once(Utc::now() + hours(1)).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(store.get(item.id).await.is_err());

    // Idempotent: a second pass finds nothing.
    let report = sweeper.sweep_once(Utc::now() + hours(1)).await.unwrap();
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let sweeper = Sweeper::new(store, Arc::new(FakeCleaner::default()), Duration::ZERO);
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(sweeper.run(Duration::from_millis(10), rx));
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
