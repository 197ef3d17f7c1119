use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// One deployment order: fetch `repository` at `branch` and run it as the
/// container for `bot_id`. Fields default to empty strings so an incomplete
/// payload reaches [`DeploymentRequest::validate`] instead of dying in the
/// JSON layer.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub repository: String,
    pub branch: String,
    pub bot_id: String,
    pub deployment_id: String,
}

impl DeploymentRequest {
    pub fn validate(&self) -> Result<(), DeployError> {
        for (field, value) in [
            ("repository", &self.repository),
            ("branch", &self.branch),
            ("botId", &self.bot_id),
            ("deploymentId", &self.deployment_id),
        ] {
            if value.trim().is_empty() {
                return Err(DeployError::Validation(field));
            }
        }
        Ok(())
    }

    pub fn image_tag(&self) -> String {
        format!("botdeploy-{}:latest", self.bot_id)
    }
}

/// Status record kept per deployment id. Completed and Failed are terminal:
/// the store never lets a record leave them.
#[derive(Clone, Debug)]
pub enum DeploymentStatus {
    Started,
    Completed(DeploymentOutcome),
    Failed(String),
}

impl DeploymentStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DeploymentStatus::Started => "STARTED",
            DeploymentStatus::Completed(_) => "COMPLETED",
            DeploymentStatus::Failed(_) => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Started)
    }
}

/// What a successful pipeline hands back to the caller.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutcome {
    pub deployment_id: String,
    pub image_tag: String,
    pub container_id: String,
    pub started_at: String,
}

/// A created container as reported by the daemon after start.
#[derive(Clone, Debug)]
pub struct Container {
    pub id: String,
    pub started_at: String,
}

/// Constraints applied verbatim to every container this worker creates.
/// Deliberately not parameterized per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub network_mode: String,
    pub no_new_privileges: bool,
    pub restart_policy: String,
    pub stop_timeout_secs: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            memory_swap_bytes: 1024 * 1024 * 1024,
            cpu_quota: 100_000,
            cpu_period: 100_000,
            network_mode: "bridge".to_string(),
            no_new_privileges: true,
            restart_policy: "unless-stopped".to_string(),
            stop_timeout_secs: 10,
        }
    }
}
