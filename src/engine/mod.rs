//! Delivery engine: capture admission, delivery workers, cleanup sweep, and
//! the pipeline that runs them.

pub mod admission;
pub mod pipeline;
pub mod sweep;
pub mod worker;

pub use admission::Admission;
pub use pipeline::{Collaborators, Pipeline, PipelineConfig, TriggerOutcome};
pub use sweep::{SweepReport, Sweeper};
pub use worker::{Processed, Worker, WorkerContext};
