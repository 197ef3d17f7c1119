use anyhow::{Context, Error};
use config::Config;

#[derive(Debug, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub docker_socket: String,
    pub workspace_root: String,
    pub clone_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub max_concurrent_deployments: usize,
    /// Build contexts are kept on disk after a successful deployment so the
    /// last deployed tree stays inspectable. Set to false to purge them.
    pub keep_workspace_after_success: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            docker_socket: "/var/run/docker.sock".to_string(),
            workspace_root: "/tmp/botdeploy".to_string(),
            clone_timeout_secs: 30,
            build_timeout_secs: 600,
            start_timeout_secs: 30,
            max_concurrent_deployments: 2,
            keep_workspace_after_success: true,
        }
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(config::Environment::with_prefix("botdeploy"))
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
