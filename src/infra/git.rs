use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use git2::build::RepoBuilder;
use log::debug;
use tokio::task;

use crate::domain::port::SourceControl;
use crate::errors::DeployError;

/// Branch-qualified clone via libgit2, run on the blocking pool under a
/// deadline. The deadline abandons a hung clone rather than killing it; the
/// workspace is purged again on the next attempt either way.
pub struct GitSource {
    pub clone_timeout: Duration,
}

#[async_trait]
impl SourceControl for GitSource {
    async fn fetch(&self, repository: &str, branch: &str, dest: &Path) -> Result<(), DeployError> {
        debug!("Cloning {} (branch {}) into {}", repository, branch, dest.display());
        let repository = repository.to_string();
        let branch = branch.to_string();
        let dest = dest.to_path_buf();

        let clone = task::spawn_blocking(move || {
            RepoBuilder::new()
                .branch(&branch)
                .clone(&repository, &dest)
                .map(|_| ())
        });

        match tokio::time::timeout(self.clone_timeout, clone).await {
            Err(_) => Err(DeployError::Clone(format!(
                "timed out after {}s",
                self.clone_timeout.as_secs()
            ))),
            Ok(Err(join_err)) => Err(DeployError::Clone(join_err.to_string())),
            Ok(Ok(Err(git_err))) => Err(DeployError::Clone(git_err.message().to_string())),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}
