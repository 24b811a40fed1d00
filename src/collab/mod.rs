//! Collaborator boundaries: capture, delivery, and artifact cleanup.
//!
//! The pipeline only sees these traits. Concrete adapters live in the
//! submodules; tests substitute their own.

pub mod command;
pub mod fs;
pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::work::{ArtifactRef, PromptConfig};

pub use command::CommandCapture;
pub use fs::FsArtifactCleaner;
pub use http::HttpDelivery;

/// Capture failed; the trigger is dropped and not retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CaptureError(pub String);

/// Delivery failed. The pipeline trusts `retryable` as given.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DeliveryError {
    pub retryable: bool,
    pub message: String,
}

impl DeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CleanupError(pub String);

/// What happened to an artifact on deletion. `NotFound` is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deleted {
    Removed,
    NotFound,
}

/// Produces an artifact on demand.
#[async_trait]
pub trait Capture: Send + Sync {
    async fn capture(&self) -> Result<ArtifactRef, CaptureError>;
}

/// Sends an artifact to the remote analysis endpoint.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        artifact: &ArtifactRef,
        prompt: &PromptConfig,
    ) -> Result<String, DeliveryError>;
}

/// Removes artifacts once their items have settled.
#[async_trait]
pub trait ArtifactCleaner: Send + Sync {
    async fn delete_artifact(&self, artifact: &ArtifactRef) -> Result<Deleted, CleanupError>;
}
