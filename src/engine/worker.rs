//! Delivery worker: claim, rate-limit, deliver, resolve.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use crate::collab::{Deliver, DeliveryError};
use crate::error::Error;
use crate::governor::RateGovernor;
use crate::model::work::{PromptConfig, State, StateUpdate, WorkItem};
use crate::queue::DeliveryQueue;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_delivery_span};

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub queue: Arc<DeliveryQueue>,
    pub governor: Arc<RateGovernor>,
    pub deliver: Arc<dyn Deliver>,
    pub retry: RetryPolicy,
    pub prompt: PromptConfig,
    pub delivery_timeout: Duration,
    pub results_dir: Option<PathBuf>,
}

/// What a single `process` call did with an item.
#[derive(Debug)]
pub enum Processed {
    Done(WorkItem),
    /// Marked `FailedRetryable` and requeued after `delay`.
    Retrying { item: WorkItem, delay: Duration },
    FailedTerminal(WorkItem),
    /// Another worker owns the item, or it no longer exists.
    Skipped,
    /// The claim hit a store error; requeued unchanged.
    ClaimDeferred,
    /// Delivery ran but the resolving write failed; the item stays `InFlight`.
    Unresolved,
}

pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    /// Consume the queue until it is closed.
    pub async fn run(self) {
        debug!(worker = self.id, "delivery worker started");
        while let Some(item) = self.ctx.queue.dequeue().await {
            self.process(item).await;
        }
        debug!(worker = self.id, "delivery worker stopped");
    }

    /// Drive one dequeued item through a single delivery attempt.
    pub async fn process(&self, item: WorkItem) -> Processed {
        let ctx = &self.ctx;
        let from = item.state;

        let claimed = match ctx
            .store
            .update_state(item.id, from, StateUpdate::claim(&item))
            .await
        {
            Ok(claimed) => claimed,
            Err(e @ (Error::Conflict { .. } | Error::InvalidTransition { .. })) => {
                warn!(worker = self.id, id = %item.id, "claim rejected, dropping: {e}");
                return Processed::Skipped;
            }
            Err(Error::NotFound(id)) => {
                warn!(worker = self.id, %id, "queued item no longer exists");
                return Processed::Skipped;
            }
            Err(e) => {
                error!(worker = self.id, id = %item.id, "claim failed: {e}");
                ctx.queue.requeue(item, ctx.retry.base_delay);
                return Processed::ClaimDeferred;
            }
        };

        let span = start_delivery_span(self.id, claimed.id, claimed.attempt_count);
        record_state_transition(&span, from, State::InFlight);

        async {
            ctx.governor.acquire().await;

            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                ctx.delivery_timeout,
                ctx.deliver.deliver(&claimed.artifact_ref, &ctx.prompt),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(DeliveryError::retryable(format!(
                    "delivery timed out after {}s",
                    ctx.delivery_timeout.as_secs_f64()
                ))),
            };
            let label = match &outcome {
                Ok(_) => "ok",
                Err(e) if e.retryable => "retryable",
                Err(_) => "terminal",
            };
            metrics::delivery_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("result", label)],
            );

            self.resolve(claimed, outcome, &span).await
        }
        .instrument(span.clone())
        .await
    }

    async fn resolve(
        &self,
        claimed: WorkItem,
        outcome: Result<String, DeliveryError>,
        span: &tracing::Span,
    ) -> Processed {
        let ctx = &self.ctx;
        let id = claimed.id;

        let (update, retry_delay) = match outcome {
            Ok(result) => (StateUpdate::done(&claimed, result), None),
            Err(e) if e.retryable && ctx.retry.can_retry(claimed.attempt_count) => {
                let delay = ctx.retry.delay(claimed.attempt_count);
                warn!(
                    %id,
                    attempt = claimed.attempt_count,
                    ?delay,
                    "retryable delivery failure: {e}"
                );
                (
                    StateUpdate::failed(&claimed, State::FailedRetryable, e.message),
                    Some(delay),
                )
            }
            Err(e) => {
                let message = if e.retryable {
                    format!("attempts exhausted: {}", e.message)
                } else {
                    e.message
                };
                error!(%id, attempt = claimed.attempt_count, "delivery failed: {message}");
                (
                    StateUpdate::failed(&claimed, State::FailedTerminal, message),
                    None,
                )
            }
        };

        let to = update.to;
        let resolved = match ctx.store.update_state(id, State::InFlight, update).await {
            Ok(item) => item,
            Err(e) => {
                error!(%id, %to, "could not record delivery outcome, leaving in flight: {e}");
                return Processed::Unresolved;
            }
        };
        record_state_transition(span, State::InFlight, to);

        match (to, retry_delay) {
            (State::Done, _) => {
                info!(%id, attempt = resolved.attempt_count, "delivered");
                if let Some(dir) = &ctx.results_dir {
                    self.write_result(dir, &resolved).await;
                }
                Processed::Done(resolved)
            }
            (State::FailedRetryable, Some(delay)) => {
                ctx.queue.requeue(resolved.clone(), delay);
                Processed::Retrying {
                    item: resolved,
                    delay,
                }
            }
            _ => Processed::FailedTerminal(resolved),
        }
    }

    /// Best-effort copy of the response next to the other results.
    async fn write_result(&self, dir: &Path, item: &WorkItem) {
        let Some(result) = item.result.as_deref() else {
            return;
        };
        let path = result_path(dir, item);
        let write = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, result).await
        };
        match write.await {
            Ok(()) => debug!(id = %item.id, path = %path.display(), "result written"),
            Err(e) => warn!(id = %item.id, path = %path.display(), "cannot write result: {e}"),
        }
    }
}

/// `<dir>/<artifact stem>.response.txt`, or `item-<id>` if the artifact has no stem.
pub fn result_path(dir: &Path, item: &WorkItem) -> PathBuf {
    let stem = item
        .artifact_ref
        .as_path()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("item-{}", item.id));
    dir.join(format!("{stem}.response.txt"))
}
