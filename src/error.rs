//! Error types for snapq.

use thiserror::Error;

use crate::collab::{CaptureError, CleanupError};
use crate::model::work::{State, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(WorkId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    /// The optimistic state check failed: another writer moved the item first.
    #[error("conflict on work item {id}: expected {expected}, found {actual}")]
    Conflict {
        id: WorkId,
        expected: State,
        actual: State,
    },

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("artifact cleanup failed: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
