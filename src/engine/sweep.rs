//! Cleanup sweep: reap settled items and their artifacts after a grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::collab::{ArtifactCleaner, Deleted};
use crate::error::Result;
use crate::store::Store;
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Items whose artifact and record are gone.
    pub removed: usize,
    /// Items kept because the artifact or the record could not be deleted.
    pub failed: usize,
}

pub struct Sweeper {
    store: Arc<Store>,
    cleaner: Arc<dyn ArtifactCleaner>,
    grace_period: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<Store>,
        cleaner: Arc<dyn ArtifactCleaner>,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            cleaner,
            grace_period,
        }
    }

    /// One pass over items settled for at least the grace period as of `now`.
    ///
    /// The artifact goes first; the record is only deleted once the artifact
    /// is confirmed gone, so a failed pass is simply repeated next time.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let Some(cutoff) = TimeDelta::from_std(self.grace_period)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
        else {
            return Ok(SweepReport::default());
        };

        let mut report = SweepReport::default();
        for item in self.store.list_settled_before(cutoff).await? {
            match self.cleaner.delete_artifact(&item.artifact_ref).await {
                Ok(deleted) => {
                    if deleted == Deleted::NotFound {
                        debug!(id = %item.id, "artifact already gone");
                    }
                    match self.store.delete(item.id).await {
                        Ok(true) => {
                            report.removed += 1;
                            metrics::items_swept()
                                .add(1, &[KeyValue::new("state", item.state.as_str())]);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(id = %item.id, "cannot delete work item: {e}");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        id = %item.id,
                        artifact = %item.artifact_ref,
                        "cannot delete artifact: {e}"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(removed = report.removed, failed = report.failed, "cleanup sweep");
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!("cleanup sweep failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("cleanup sweep stopped");
                        return;
                    }
                }
            }
        }
    }
}
