//! Pipeline: wires debouncer, admission, queue, workers and sweep together.
//!
//! Startup runs crash recovery and rehydrates the queue before any worker
//! starts. Shutdown stops admissions, closes the queue, stops the sweep and
//! waits for every task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::admission::Admission;
use super::sweep::Sweeper;
use super::worker::{Worker, WorkerContext};
use crate::collab::{ArtifactCleaner, Capture, CaptureError, Deliver};
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::{Error, Result};
use crate::governor::RateGovernor;
use crate::model::work::{PromptConfig, WorkItem};
use crate::queue::DeliveryQueue;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::telemetry::metrics;

/// Runtime knobs for the pipeline, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_interval: Duration,
    pub retry: RetryPolicy,
    pub rate_capacity: u32,
    pub rate_per_sec: f64,
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    pub workers: usize,
    pub delivery_timeout: Duration,
    pub prompt: PromptConfig,
    pub results_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_interval: crate::debounce::DEFAULT_MIN_INTERVAL,
            retry: RetryPolicy::default(),
            rate_capacity: 1,
            rate_per_sec: 1.0,
            grace_period: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            workers: 1,
            delivery_timeout: Duration::from_secs(60),
            prompt: PromptConfig::default(),
            results_dir: None,
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            min_interval: config.min_interval(),
            retry: config.retry_policy(),
            rate_capacity: config.rate_capacity,
            rate_per_sec: config.rate_per_sec,
            grace_period: config.grace_period(),
            sweep_interval: config.sweep_interval(),
            workers: config.workers,
            delivery_timeout: config.delivery_timeout(),
            prompt: config.prompt_config(),
            results_dir: config.results_dir.clone(),
        }
    }
}

/// The three external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn Capture>,
    pub deliver: Arc<dyn Deliver>,
    pub cleaner: Arc<dyn ArtifactCleaner>,
}

/// What happened to a trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// Within `min_interval` of the last admitted trigger; dropped.
    Debounced,
    Admitted(WorkItem),
    /// Capture failed; nothing was created.
    CaptureFailed(CaptureError),
    /// Capture succeeded but the item could not be persisted.
    Failed(Error),
    /// The pipeline is shutting down.
    Stopped,
}

pub struct Pipeline {
    store: Arc<Store>,
    queue: Arc<DeliveryQueue>,
    admission: Admission,
    debouncer: Mutex<Debouncer>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Recover, rehydrate, and spawn the worker pool and cleanup sweep.
    pub async fn start(
        store: Arc<Store>,
        collab: Collaborators,
        config: PipelineConfig,
    ) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        let governor = Arc::new(RateGovernor::new(config.rate_capacity, config.rate_per_sec)?);

        let recovery = store.recover_in_flight(config.retry.max_attempts).await?;
        if recovery.requeued > 0 || recovery.exhausted > 0 {
            warn!(
                requeued = recovery.requeued,
                exhausted = recovery.exhausted,
                "recovered items interrupted by a previous run"
            );
        }

        let queue = Arc::new(DeliveryQueue::new());
        let rehydrated = queue.rehydrate(&store).await?;

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            governor,
            deliver: collab.deliver,
            retry: config.retry.clone(),
            prompt: config.prompt.clone(),
            delivery_timeout: config.delivery_timeout,
            results_dir: config.results_dir.clone(),
        });

        let mut tasks = Vec::with_capacity(config.workers + 1);
        for id in 0..config.workers {
            tasks.push(tokio::spawn(Worker::new(id, Arc::clone(&ctx)).run()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = Sweeper::new(
            Arc::clone(&store),
            Arc::clone(&collab.cleaner),
            config.grace_period,
        );
        tasks.push(tokio::spawn(sweeper.run(config.sweep_interval, shutdown_rx)));

        info!(workers = config.workers, rehydrated, "pipeline started");

        Ok(Self {
            admission: Admission::new(
                Arc::clone(&store),
                Arc::clone(&queue),
                collab.capture,
                collab.cleaner,
            ),
            store,
            queue,
            debouncer: Mutex::new(Debouncer::new(config.min_interval)),
            accepting: AtomicBool::new(true),
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    /// Handle one trigger observed at `at`. Never waits on delivery.
    pub async fn on_trigger(&self, at: Instant) -> TriggerOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            metrics::triggers().add(1, &[KeyValue::new("result", "stopped")]);
            return TriggerOutcome::Stopped;
        }

        let admitted = self
            .debouncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(at);
        if !admitted {
            metrics::triggers().add(1, &[KeyValue::new("result", "debounced")]);
            debug!("trigger debounced");
            return TriggerOutcome::Debounced;
        }
        metrics::triggers().add(1, &[KeyValue::new("result", "admitted")]);

        match self.admission.on_admitted_trigger().await {
            Ok(item) => TriggerOutcome::Admitted(item),
            Err(Error::Capture(e)) => {
                warn!("capture failed, trigger dropped: {e}");
                TriggerOutcome::CaptureFailed(e)
            }
            Err(e) => {
                warn!("could not admit capture: {e}");
                TriggerOutcome::Failed(e)
            }
        }
    }

    /// Stop accepting triggers, drain the tasks, and wait for them to exit.
    ///
    /// Workers finish the item they hold. Items still queued stay in the store
    /// and are picked up on the next start.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.queue.close();
        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("pipeline task ended abnormally: {e}");
            }
        }
        info!("pipeline stopped");
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}
