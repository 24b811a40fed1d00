//! Filesystem artifact cleanup.

use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::debug;

use super::{ArtifactCleaner, CleanupError, Deleted};
use crate::model::work::ArtifactRef;

/// Deletes artifact files. A file that is already gone counts as cleaned.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsArtifactCleaner;

#[async_trait]
impl ArtifactCleaner for FsArtifactCleaner {
    async fn delete_artifact(&self, artifact: &ArtifactRef) -> Result<Deleted, CleanupError> {
        match tokio::fs::remove_file(artifact.as_path()).await {
            Ok(()) => {
                debug!(artifact = %artifact, "artifact removed");
                Ok(Deleted::Removed)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Deleted::NotFound),
            Err(e) => Err(CleanupError(format!("cannot remove {artifact}: {e}"))),
        }
    }
}
