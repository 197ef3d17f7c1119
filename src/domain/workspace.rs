use std::io::ErrorKind;
use std::path::PathBuf;

use log::{info, warn};
use tokio::fs;

use super::port::SourceControl;
use crate::errors::DeployError;

const BUILD_DESCRIPTOR: &str = "Dockerfile";

/// Prepares one build context per bot under a common root. The directory is
/// recreated from scratch on every acquire; stale contents never survive.
pub struct WorkspaceManager {
    root: PathBuf,
    source: Box<dyn SourceControl + Send + Sync>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, source: Box<dyn SourceControl + Send + Sync>) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    pub fn path_for(&self, bot_id: &str) -> PathBuf {
        self.root.join(bot_id)
    }

    /// Purge any previous directory for the bot (best-effort), fetch the
    /// branch into a fresh one, and verify the build descriptor is present.
    pub async fn acquire(
        &self,
        bot_id: &str,
        repository: &str,
        branch: &str,
    ) -> Result<PathBuf, DeployError> {
        let dir = self.path_for(bot_id);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("Failed to purge workspace {}: {}", dir.display(), err);
            }
        }

        info!("Cloning repository {} (branch {})", repository, branch);
        self.source.fetch(repository, branch, &dir).await?;

        let descriptor = dir.join(BUILD_DESCRIPTOR);
        match fs::try_exists(&descriptor).await {
            Ok(true) => Ok(dir),
            _ => Err(DeployError::MissingBuildFile),
        }
    }

    /// Remove the bot's build context. Failures are logged, never returned.
    pub async fn release(&self, bot_id: &str) {
        let dir = self.path_for(bot_id);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("Failed to remove workspace {}: {}", dir.display(), err);
            }
        }
    }
}
