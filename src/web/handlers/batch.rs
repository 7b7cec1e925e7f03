use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use super::events;
use crate::error::{BatchError, Result};
use crate::schedule::{BatchScheduler, JobOptions};
use crate::web::Pagination;

pub fn batch_router(scheduler: Arc<BatchScheduler>) -> Router {
    Router::new()
        .route("/", post(create_batch).get(list_batches))
        .route("/:batch_id", get(get_batch).delete(delete_batch))
        .route("/:batch_id/jobs", post(add_job))
        .route("/:batch_id/jobs/:job_id", get(get_job))
        .route("/:batch_id/start", post(start_batch))
        .route("/:batch_id/cancel", post(cancel_batch))
        .route("/:batch_id/events", get(events::batch_events))
        .with_state(scheduler)
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

fn status_of(e: &BatchError) -> StatusCode {
    match e {
        BatchError::NotFound(_) => StatusCode::NOT_FOUND,
        BatchError::InvalidState(_) | BatchError::CancellationRace { .. } => StatusCode::CONFLICT,
        BatchError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        BatchError::JobExecution { .. } | BatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T>, ok: StatusCode, action: &str) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (ok, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = status_of(&e);
            if status.is_server_error() {
                error!("Failed to {}: {}", action, e);
            }
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateBatchRequest {
    name: Option<String>,
    max_concurrent: Option<i64>,
    callback_url: Option<String>,
}

// Create batch endpoint
async fn create_batch(
    State(scheduler): State<Arc<BatchScheduler>>,
    Json(req): Json<CreateBatchRequest>,
) -> impl IntoResponse {
    let result = async {
        let max_concurrent = match req.max_concurrent {
            Some(n) if n < 1 => {
                return Err(BatchError::InvalidArgument(format!("max_concurrent must be positive, got {}", n)));
            }
            Some(n) => Some(usize::try_from(n).unwrap_or(usize::MAX)),
            None => None,
        };
        scheduler.create_batch(req.name, max_concurrent, req.callback_url).await
    }
    .await;
    respond(result, StatusCode::CREATED, "create batch")
}

// List batches endpoint
async fn list_batches(
    State(scheduler): State<Arc<BatchScheduler>>,
    Query(pagination): Query<Pagination>,
) -> impl IntoResponse {
    let batches = scheduler.list_batches().await;
    respond(Ok(pagination.apply(batches)), StatusCode::OK, "list batches")
}

// Get batch endpoint
async fn get_batch(
    State(scheduler): State<Arc<BatchScheduler>>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    respond(scheduler.get_batch(&batch_id).await, StatusCode::OK, "get batch")
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    force: bool,
}

// Delete batch endpoint, `?force=true` cancels a processing batch first
async fn delete_batch(
    State(scheduler): State<Arc<BatchScheduler>>,
    Path(batch_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> impl IntoResponse {
    let result = if params.force {
        scheduler.force_delete_batch(&batch_id).await
    } else {
        scheduler.delete_batch(&batch_id).await
    };
    respond(result, StatusCode::OK, "delete batch")
}

#[derive(Debug, Deserialize)]
struct AddJobRequest {
    source_ref: String,
    display_name: Option<String>,
    options: Option<JobOptions>,
}

// Add job endpoint
async fn add_job(
    State(scheduler): State<Arc<BatchScheduler>>,
    Path(batch_id): Path<String>,
    Json(req): Json<AddJobRequest>,
) -> impl IntoResponse {
    let result = scheduler
        .add_job(&batch_id, req.source_ref, req.display_name, req.options)
        .await;
    respond(result, StatusCode::CREATED, "add job")
}

// Get job endpoint
async fn get_job(
    State(scheduler): State<Arc<BatchScheduler>>,
    Path((batch_id, job_id)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(scheduler.get_job(&batch_id, &job_id).await, StatusCode::OK, "get job")
}

// Start batch endpoint
async fn start_batch(
    State(scheduler): State<Arc<BatchScheduler>>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    let result = match scheduler.start_batch(&batch_id).await {
        Ok(()) => scheduler.get_batch(&batch_id).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::OK, "start batch")
}

// Cancel batch endpoint
async fn cancel_batch(
    State(scheduler): State<Arc<BatchScheduler>>,
    Path(batch_id): Path<String>,
) -> impl IntoResponse {
    let result = match scheduler.cancel_batch(&batch_id).await {
        Ok(()) => scheduler.get_batch(&batch_id).await,
        Err(e) => Err(e),
    };
    respond(result, StatusCode::OK, "cancel batch")
}
