use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::secret::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use log::info;
use map_macro::hash_map;
use tokio::task;

use crate::domain::model::{Container, ResourceLimits};
use crate::domain::port::{BuildLogStream, ContainerRuntime, ImageBuilder};
use crate::errors::DeployError;

/// All daemon operations go through this one adapter: image builds, the
/// previous-container retirement, container create/start/inspect, and the
/// raw log read.
pub struct DockerRuntime {
    pub docker: bollard::Docker,
}

/// Name used to look up and retire a bot's previous container.
pub(crate) fn retirement_name(bot_id: &str) -> String {
    format!("bot-{}", bot_id)
}

/// Name assigned to a newly created container.
// TODO retire by the botdeploy.bot.id label instead: created names carry a
// timestamp suffix, so the fixed retirement lookup never matches a container
// this worker created itself.
pub(crate) fn creation_name(bot_id: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backward")
        .as_millis();
    format!("bot-{}-{}", bot_id, millis)
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::NO,
    }
}

pub(crate) fn host_config_for(limits: &ResourceLimits) -> HostConfig {
    HostConfig {
        memory: Some(limits.memory_bytes),
        memory_swap: Some(limits.memory_swap_bytes),
        cpu_quota: Some(limits.cpu_quota),
        cpu_period: Some(limits.cpu_period),
        network_mode: Some(limits.network_mode.clone()),
        security_opt: limits
            .no_new_privileges
            .then(|| vec!["no-new-privileges".to_string()]),
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy_name(&limits.restart_policy)),
            maximum_retry_count: None,
        }),
        ..Default::default()
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

async fn archive_context(context: &Path) -> Result<Bytes, DeployError> {
    let context = context.to_path_buf();
    task::spawn_blocking(move || -> Result<Bytes, Error> {
        let tar_gz = BytesMut::new().writer();
        let enc = GzEncoder::new(tar_gz, Compression::default());
        let mut tar = tar::Builder::new(enc);
        tar.append_dir_all(".", &context)?;
        let tar_gz = tar.into_inner()?.finish()?;
        Ok(tar_gz.into_inner().freeze())
    })
    .await
    .map_err(|err| DeployError::Build(err.to_string()))?
    .map_err(|err| DeployError::Build(format!("failed to archive build context: {}", err)))
}

#[async_trait]
impl ImageBuilder for DockerRuntime {
    async fn build(&self, context: &Path, image_tag: &str) -> Result<BuildLogStream, DeployError> {
        let body = archive_context(context).await?;

        info!("Submitting build context for {}", image_tag);
        let stream = self.docker.build_image(
            BuildImageOptions {
                dockerfile: "Dockerfile".to_string(),
                t: image_tag.to_string(),
                rm: true,
                ..Default::default()
            },
            None,
            Some(body),
        );

        Ok(stream
            .filter_map(|item| {
                let mapped = match item {
                    Ok(build_info) => {
                        if let Some(error) = build_info.error {
                            Some(Err(DeployError::Build(error)))
                        } else {
                            build_info
                                .stream
                                .map(|line| line.trim_end().to_string())
                                .filter(|line| !line.is_empty())
                                .map(Ok)
                        }
                    }
                    Err(err) => Some(Err(DeployError::Build(err.to_string()))),
                };
                std::future::ready(mapped)
            })
            .boxed())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn replace_previous(&self, bot_id: &str) -> Result<(), Error> {
        let name = retirement_name(bot_id);
        match self.docker.inspect_container(&name, None).await {
            Err(err) if is_not_found(&err) => {
                info!("No previous container {} to retire", name);
                return Ok(());
            }
            Err(err) => {
                return Err(err).context(format!("Error looking up container {}", name))
            }
            Ok(_) => {}
        }

        info!("Retiring previous container {}", name);
        self.docker
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    t: ResourceLimits::default().stop_timeout_secs,
                }),
            )
            .await
            .context(format!("Error while stopping container {}", name))?;
        self.docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .context(format!("Error while removing container {}", name))
    }

    async fn create_and_start(
        &self,
        image_tag: &str,
        bot_id: &str,
        deployment_id: &str,
        limits: &ResourceLimits,
    ) -> Result<Container, DeployError> {
        let config = Config {
            image: Some(image_tag.to_string()),
            env: Some(vec![
                format!("BOT_ID={}", bot_id),
                format!("DEPLOYMENT_ID={}", deployment_id),
            ]),
            labels: Some(hash_map! {
                String::from("botdeploy.bot.id") => bot_id.to_string(),
                String::from("botdeploy.deployment.id") => deployment_id.to_string(),
            }),
            stop_timeout: Some(limits.stop_timeout_secs),
            host_config: Some(host_config_for(limits)),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: creation_name(bot_id),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| DeployError::Startup(err.to_string()))?;
        info!("Created container {}", created.id);

        self.docker
            .start_container(created.id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| DeployError::Startup(err.to_string()))?;

        // A single inspect is authoritative; no retry or backoff.
        let inspected = self
            .docker
            .inspect_container(created.id.as_str(), None)
            .await
            .map_err(|err| DeployError::Startup(err.to_string()))?;
        let state = inspected.state;
        if !state.as_ref().and_then(|s| s.running).unwrap_or(false) {
            return Err(DeployError::Startup(
                "daemon reports not running".to_string(),
            ));
        }

        Ok(Container {
            id: created.id,
            started_at: state.and_then(|s| s.started_at).unwrap_or_default(),
        })
    }

    async fn tail_logs(&self, container_id: &str, tail: usize) -> Result<Vec<String>, Error> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                follow: false,
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(output) = stream.next().await {
            let output = output.context("Error while reading container logs")?;
            for line in String::from_utf8_lossy(&output.into_bytes()).lines() {
                let line = line.trim();
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
        }
        Ok(lines)
    }
}
