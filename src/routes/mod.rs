pub mod generate;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::queue::QueueError;

/// Health and the authenticated generation API.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/generate", post(generate::submit_generation))
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/{job_id}", delete(jobs::cancel_job))
        .route("/api/v1/jobs/{job_id}/result", get(jobs::get_job_result))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by API handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            QueueError::InvalidModel(_) | QueueError::Request(_) => StatusCode::UNPROCESSABLE_ENTITY,
            QueueError::Ledger(_) | QueueError::Persistence(_) => {
                tracing::error!(error = %err, "Queue backend failure");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::model_config::Quality;
    use crate::models::request::RequestError;
    use crate::services::credits::CreditError;
    use crate::services::kv::KvError;

    fn status_of(err: QueueError) -> StatusCode {
        ApiError::from(err).status
    }

    #[test]
    fn test_admission_errors_map_to_client_statuses() {
        assert_eq!(
            status_of(QueueError::InsufficientCredits { required: 2 }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(QueueError::InvalidModel("nope".to_string())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(QueueError::Request(RequestError::UnsupportedQuality {
                model: "turbo".to_string(),
                quality: Quality::UltraHd,
            })),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(QueueError::Request(RequestError::UnknownAspectRatio("7:3".to_string()))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_backend_errors_map_to_service_unavailable() {
        assert_eq!(
            status_of(QueueError::Ledger(CreditError::Database(sqlx::Error::PoolTimedOut))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(
            status_of(QueueError::Persistence(KvError::Io(io))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_message_is_kept() {
        let err = ApiError::from(QueueError::InsufficientCredits { required: 3 });
        assert_eq!(err.message, "Insufficient credits: 3 required");
    }
}
