use crate::BrokerServer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tasklane_core::{Job, QueueCounts, QueueName};
use uuid::Uuid;

/// REST API routes
pub fn create_rest_api(broker: Arc<BrokerServer>) -> Router {
    Router::new()
        .route("/api/v1/jobs/:job_id", get(get_job))
        .route("/api/v1/queues", get(list_queues))
        .route("/health", get(health_check))
        .with_state(broker)
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job_id: Uuid,
    queue: QueueName,
    task_name: String,
    state: String,
    attempts: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_id: Option<String>,
    /// Decoded JSON payload when it parses, otherwise omitted
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        JobResponse {
            data: serde_json::from_slice(&job.payload).ok(),
            job_id: job.id,
            queue: job.queue,
            task_name: job.task_name,
            state: job.state.as_str().to_string(),
            attempts: job.attempts,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            error: job.error,
            worker_id: job.worker_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct QueueResponse {
    queue: QueueName,
    #[serde(flatten)]
    counts: QueueCounts,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    waiting_jobs: usize,
}

/// Get job by ID
async fn get_job(
    State(broker): State<Arc<BrokerServer>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = broker.store().get(&job_id).ok_or(ApiError::NotFound)?;
    Ok(Json(job.into()))
}

/// Per-queue job counts
async fn list_queues(State(broker): State<Arc<BrokerServer>>) -> Json<Vec<QueueResponse>> {
    let queues = QueueName::ALL
        .into_iter()
        .map(|queue| QueueResponse {
            queue,
            counts: broker.store().counts(queue),
        })
        .collect();

    Json(queues)
}

/// Health check endpoint
async fn health_check(State(broker): State<Arc<BrokerServer>>) -> Json<HealthResponse> {
    let waiting_jobs = QueueName::ALL
        .into_iter()
        .map(|queue| broker.store().counts(queue).waiting)
        .sum();

    Json(HealthResponse {
        status: "healthy".to_string(),
        waiting_jobs,
    })
}

/// API error types
#[derive(Debug)]
enum ApiError {
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
