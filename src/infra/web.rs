use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use log::error;
use serde::Deserialize;
use serde_json::json;

use crate::domain::model::DeploymentRequest;
use crate::domain::DeploymentService;
use crate::errors::DeployError;

pub fn router(service: DeploymentService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/deploy", post(deploy))
        .route("/status/:deployment_id", get(deployment_status))
        .route("/containers/:container_id/logs", get(container_logs))
        .with_state(Arc::new(service))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn deploy(
    State(service): State<Arc<DeploymentService>>,
    Json(request): Json<DeploymentRequest>,
) -> impl IntoResponse {
    let deployment_id = request.deployment_id.clone();
    match service.deploy(request).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "deploymentId": outcome.deployment_id,
                "imageTag": outcome.image_tag,
                "containerId": outcome.container_id,
                "status": "RUNNING",
                "startedAt": outcome.started_at,
            })),
        ),
        Err(err) => {
            error!("Error during deploy {:?}", err);
            let code = match err {
                DeployError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                code,
                Json(json!({
                    "success": false,
                    "deploymentId": deployment_id,
                    "error": err.to_string(),
                })),
            )
        }
    }
}

async fn deployment_status(
    State(service): State<Arc<DeploymentService>>,
    Path(deployment_id): Path<String>,
) -> impl IntoResponse {
    let status = service
        .status
        .get(&deployment_id)
        .map(|record| record.label())
        .unwrap_or("NOT_FOUND");
    Json(json!({ "status": status }))
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn container_logs(
    State(service): State<Arc<DeploymentService>>,
    Path(container_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    if container_id.is_empty() || !container_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!(["Invalid container ID format"])),
        );
    }

    match service
        .container_logs(&container_id, query.tail.unwrap_or(100))
        .await
    {
        Ok(lines) if lines.is_empty() => (StatusCode::OK, Json(json!(["No logs available"]))),
        Ok(lines) => {
            let stamped: Vec<String> = lines
                .iter()
                .map(|line| format!("[{}] {}", Utc::now().to_rfc3339(), line))
                .collect();
            (StatusCode::OK, Json(json!(stamped)))
        }
        Err(err) => {
            error!("Error fetching container logs {:?}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!([format!("Error fetching logs: {}", err)])),
            )
        }
    }
}
