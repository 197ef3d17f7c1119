use thiserror::Error;

/// Stage errors of the deployment pipeline. Each variant maps to the stage
/// that produced it; the coordinator records the rendered message as the
/// terminal FAILED status.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("missing required field: {0}")]
    Validation(&'static str),

    #[error("failed to clone repository: {0}")]
    Clone(String),

    #[error("Dockerfile not found in repository")]
    MissingBuildFile,

    #[error("docker build failed: {0}")]
    Build(String),

    #[error("container failed to start: {0}")]
    Startup(String),
}
