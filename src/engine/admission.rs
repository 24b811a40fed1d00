//! Capture admission: turn an admitted trigger into a persisted, queued item.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::collab::{ArtifactCleaner, Capture};
use crate::error::{Error, Result};
use crate::model::work::{NewWorkItem, WorkItem};
use crate::queue::DeliveryQueue;
use crate::store::Store;
use crate::telemetry::metrics;

pub struct Admission {
    store: Arc<Store>,
    queue: Arc<DeliveryQueue>,
    capture: Arc<dyn Capture>,
    cleaner: Arc<dyn ArtifactCleaner>,
}

impl Admission {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<DeliveryQueue>,
        capture: Arc<dyn Capture>,
        cleaner: Arc<dyn ArtifactCleaner>,
    ) -> Self {
        Self {
            store,
            queue,
            capture,
            cleaner,
        }
    }

    /// Capture, persist as `Pending`, then enqueue.
    ///
    /// A capture failure returns [`Error::Capture`] and creates nothing. If the
    /// store write fails, the fresh artifact is removed best-effort and the
    /// store error is returned.
    pub async fn on_admitted_trigger(&self) -> Result<WorkItem> {
        let artifact = match self.capture.capture().await {
            Ok(a) => {
                metrics::captures().add(1, &[KeyValue::new("result", "ok")]);
                a
            }
            Err(e) => {
                metrics::captures().add(1, &[KeyValue::new("result", "error")]);
                return Err(Error::Capture(e));
            }
        };

        let item = match self.store.put(NewWorkItem::new(artifact.clone())).await {
            Ok(item) => item,
            Err(e) => {
                if let Err(cleanup) = self.cleaner.delete_artifact(&artifact).await {
                    warn!(%artifact, "orphaned artifact after failed store write: {cleanup}");
                }
                return Err(e);
            }
        };

        if !self.queue.enqueue(item.clone()) {
            if self.queue.is_closed() {
                // Picked up again on restart.
                info!(id = %item.id, "queue closed, item left pending");
            } else {
                warn!(id = %item.id, "item already queued");
            }
        }

        info!(id = %item.id, artifact = %item.artifact_ref, "work item admitted");
        Ok(item)
    }
}
