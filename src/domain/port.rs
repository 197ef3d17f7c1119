use std::path::Path;

use anyhow::Error;
use async_trait::async_trait;
use futures::stream::BoxStream;

use super::model::{Container, ResourceLimits};
use crate::errors::DeployError;

/// Build output as a lazy, finite stream of log lines. An `Err` item carries
/// the daemon's build failure; the stream ending without one means the image
/// was built and tagged.
pub type BuildLogStream = BoxStream<'static, Result<String, DeployError>>;

/// Version-control fetch into a local directory. The implementation owns its
/// deadline policy.
#[async_trait]
pub trait SourceControl {
    async fn fetch(&self, repository: &str, branch: &str, dest: &Path) -> Result<(), DeployError>;
}

#[async_trait]
pub trait ImageBuilder {
    /// Submit the directory at `context` as a build context tagged
    /// `image_tag`. Errors here are submission failures; build failures
    /// arrive through the returned stream.
    async fn build(&self, context: &Path, image_tag: &str) -> Result<BuildLogStream, DeployError>;
}

#[async_trait]
pub trait ContainerRuntime {
    /// Stop and remove the container registered under the bot's fixed name.
    /// A missing container is a no-op. Callers treat any error here as
    /// non-fatal.
    async fn replace_previous(&self, bot_id: &str) -> Result<(), Error>;

    /// Create a container from `image_tag` under the fixed resource limits,
    /// start it, and confirm with a single inspect that it is running.
    async fn create_and_start(
        &self,
        image_tag: &str,
        bot_id: &str,
        deployment_id: &str,
        limits: &ResourceLimits,
    ) -> Result<Container, DeployError>;

    /// Raw daemon-reported output for a container, newest `tail` lines.
    async fn tail_logs(&self, container_id: &str, tail: usize) -> Result<Vec<String>, Error>;
}
