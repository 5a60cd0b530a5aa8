use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::models::job::JobId;
use crate::models::request::GenerationRequest;
use crate::routes::ApiError;

/// Response after admitting a generation request.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_ids: Vec<JobId>,
    pub status: String,
}

/// POST /api/v1/generate: queue one job per requested image.
pub async fn submit_generation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    let queue = state.queues.for_user(&user_id).await?;
    let job_ids = queue.enqueue_request(&request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            job_ids,
            status: "pending".to_string(),
        }),
    ))
}
