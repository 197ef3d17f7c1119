use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::info;
use tokio::net::TcpListener;

use config::load_config;
use domain::status::StatusStore;
use domain::workspace::WorkspaceManager;
use domain::{DeploymentService, LogObserver, PipelineOptions};
use infra::{docker::DockerRuntime, git::GitSource, web::router};

mod config;
mod domain;
mod errors;
mod infra;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config()?;
    info!("Loaded config {:?}", config);
    let docker = Docker::connect_with_socket(&config.docker_socket, 120, API_DEFAULT_VERSION)
        .context("Can't connect to docker socket")?;

    let service = DeploymentService::new(
        WorkspaceManager::new(
            &config.workspace_root,
            Box::new(GitSource {
                clone_timeout: Duration::from_secs(config.clone_timeout_secs),
            }),
        ),
        Box::new(DockerRuntime {
            docker: docker.clone(),
        }),
        Box::new(DockerRuntime { docker }),
        Arc::new(StatusStore::new()),
        Box::new(LogObserver),
        PipelineOptions {
            build_timeout: Duration::from_secs(config.build_timeout_secs),
            start_timeout: Duration::from_secs(config.start_timeout_secs),
            max_concurrent_deployments: config.max_concurrent_deployments,
            keep_workspace_after_success: config.keep_workspace_after_success,
        },
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("botdeploy worker listening on port {}", config.port);
    axum::serve(listener, router(service)).await?;
    Ok(())
}
