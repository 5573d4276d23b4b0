// HTTP route handlers for the Testbox API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use std::time::Instant;
use testbox_common::types::{
    ErrorResponse, ExecutionRequest, ImageBuildRequest, ImageBuildStatus, ImageRemoveRequest,
    ImageRemoveStatus,
};
use testbox_engine::SandboxError;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

/// Engine error rendered as a JSON reply
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(SandboxError::Validation(rejection.body_text()))
    }
}

pub fn error_status(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::Validation(_) => StatusCode::BAD_REQUEST,
        SandboxError::PolicyRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SandboxError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::ImageInUse(_) => StatusCode::CONFLICT,
        SandboxError::ImageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "Request failed");
        } else {
            warn!(kind = self.0.kind(), error = %self.0, "Request rejected");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// POST /run - Execute a submission against its tests
pub async fn run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let started = Instant::now();

    let result = state.orchestrator.execute(request).await;
    metrics::RUN_DURATION.observe(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            metrics::RUNS_TOTAL
                .with_label_values(&[response.status.as_str()])
                .inc();
            info!(
                status = response.status.as_str(),
                tests = response.test_statuses.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Run served"
            );
            Ok((StatusCode::OK, Json(response)).into_response())
        }
        Err(e) => {
            metrics::RUNS_TOTAL.with_label_values(&[e.kind()]).inc();
            Err(e.into())
        }
    }
}

/// POST /images/build - Build a named custom image
pub async fn build_image(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ImageBuildRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;

    let response = state
        .orchestrator
        .build_image(&request.image_name, &request.libraries)
        .await
        .inspect_err(|e| {
            metrics::IMAGE_OPS_TOTAL
                .with_label_values(&["build", e.kind()])
                .inc();
        })?;

    let outcome = match response.status {
        ImageBuildStatus::Success => "success",
        ImageBuildStatus::Error => "error",
    };
    metrics::IMAGE_OPS_TOTAL
        .with_label_values(&["build", outcome])
        .inc();

    Ok((StatusCode::OK, Json(response)).into_response())
}

/// POST /images/remove - Remove a named custom image
pub async fn remove_image(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ImageRemoveRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;

    let response = state
        .orchestrator
        .remove_image(&request.image_name)
        .await
        .inspect_err(|e| {
            metrics::IMAGE_OPS_TOTAL
                .with_label_values(&["remove", e.kind()])
                .inc();
        })?;

    let (status, outcome) = match response.status {
        ImageRemoveStatus::Success => (StatusCode::OK, "success"),
        ImageRemoveStatus::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ImageRemoveStatus::Conflict => (StatusCode::CONFLICT, "conflict"),
    };
    metrics::IMAGE_OPS_TOTAL
        .with_label_values(&["remove", outcome])
        .inc();

    Ok((status, Json(response)).into_response())
}

/// GET /images/{image_name} - Lifecycle state of a custom image
pub async fn image_status(
    State(state): State<Arc<AppState>>,
    Path(image_name): Path<String>,
) -> Result<Response, ApiError> {
    let response = state.orchestrator.image_status(&image_name).await?;
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics(State(state): State<Arc<AppState>>) -> Response {
    metrics::ACTIVE_RUNS.set(state.orchestrator.active_runs() as i64);
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
