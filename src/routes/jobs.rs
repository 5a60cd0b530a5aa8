use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::models::job::{GenerationJob, JobId};
use crate::models::result::ResultRecord;
use crate::routes::ApiError;

/// GET /api/v1/jobs: the caller's queue in enqueue order.
pub async fn list_jobs(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<GenerationJob>>, ApiError> {
    let queue = state.queues.for_user(&user_id).await?;
    Ok(Json(queue.snapshot().await))
}

/// DELETE /api/v1/jobs/{job_id}: cancel or dismiss a job.
pub async fn cancel_job(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let queue = state.queues.for_user(&user_id).await?;
    if queue.cancel(JobId(job_id)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "Job not found"))
    }
}

/// GET /api/v1/jobs/{job_id}/result: stored result row, looked up directly
/// in the result table.
pub async fn get_job_result(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ResultRecord>, ApiError> {
    let record = state
        .results
        .find_by_job(JobId(job_id))
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Result lookup failed");
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Result lookup failed")
        })?
        .filter(|r| r.record.user_id == user_id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "No result for job"))?;

    Ok(Json(record))
}
