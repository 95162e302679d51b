//! HTTP surface.
//!
//! - `POST /request/{version}/{vendor}/{model}`: multipart upload (field `file`)
//! - `GET /result/{id}`: job status; terminal jobs are returned once, then deleted
//! - `GET /result/`: queue and lease overview
//! - `GET /health`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::BatchError;
use crate::scheduler::{JobStatus, JobView, Placement, QueueSnapshot, ResourceClass};
use crate::service::BatchService;

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<BatchService>,
    pub max_upload_bytes: usize,
}

/// Error body in the `{"detail": ...}` shape.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                detail: self.detail,
            }),
        )
            .into_response()
    }
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        let status = match &err {
            BatchError::UnknownResourceClass(_) => StatusCode::NOT_FOUND,
            BatchError::InvalidResourceSpec(_) => StatusCode::BAD_REQUEST,
            BatchError::Payload { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BatchError::DispatcherUnavailable | BatchError::ExecutorUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    id: Uuid,
    status: JobStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ResultResponse {
    id: Uuid,
    status: JobStatus,
    version: String,
    vendor: String,
    model: String,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    machine: Option<String>,
    completed: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_data: Option<String>,
}

impl From<JobView> for ResultResponse {
    fn from(view: JobView) -> Self {
        let job = view.job;
        let (message, position) = match job.status {
            JobStatus::Queued => {
                let position = view.position.unwrap_or(0);
                (format!("Job is in queue at position {position}"), Some(position))
            }
            JobStatus::Running => (
                format!(
                    "Job is running on {}",
                    job.bound_resource.as_deref().unwrap_or("-")
                ),
                None,
            ),
            JobStatus::Completed => ("Job completed successfully".to_string(), None),
            JobStatus::Failed => ("Job processing failed".to_string(), None),
        };
        let completed = job.status.is_terminal();

        Self {
            id: job.id,
            status: job.status,
            version: job.version,
            vendor: job.class.vendor,
            model: job.class.model,
            enqueued_at: job.enqueued_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            machine: job.bound_resource,
            completed,
            message,
            position,
            result_data: if completed { job.result_data } else { None },
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: ApiState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health_handler))
        .route("/request/{version}/{vendor}/{model}", post(create_request_handler))
        .route("/result", get(queue_status_handler))
        .route("/result/", get(queue_status_handler))
        .route("/result/{id}", get(result_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn create_request_handler(
    State(state): State<ApiState>,
    Path((version, vendor, model)): Path<(String, String, String)>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut data = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            data = Some(field.bytes().await?);
            break;
        }
    }

    let Some(data) = data else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "file is required"));
    };
    if data.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "file is empty"));
    }
    if data.len() > state.max_upload_bytes {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("file too large (>{} bytes)", state.max_upload_bytes),
        ));
    }

    let class = ResourceClass::new(vendor, model);
    let submission = state.service.submit(&version, class, &data).await?;

    let response = match submission.placement {
        Placement::Running { resource_id } => SubmitResponse {
            id: submission.job.id,
            status: JobStatus::Running,
            message: "Request accepted and started processing.".to_string(),
            machine: Some(resource_id),
            position: None,
        },
        Placement::Queued { position } => SubmitResponse {
            id: submission.job.id,
            status: JobStatus::Queued,
            message: "Request accepted and queued.".to_string(),
            machine: None,
            position: Some(position),
        },
    };
    Ok(Json(response))
}

async fn result_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ResultResponse>, ApiError> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "job not found");

    let id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let view = state.service.result(id).await?.ok_or_else(not_found)?;
    Ok(Json(view.into()))
}

async fn queue_status_handler(
    State(state): State<ApiState>,
) -> Result<Json<QueueSnapshot>, ApiError> {
    Ok(Json(state.service.status().await?))
}
