use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::db::DatabaseError;
use crate::pipeline::PipelineError;
use crate::queue::QueueError;
use crate::stages::StageError;

const ERROR_INTERNAL: &str = "internal_error";
const ERROR_FORBIDDEN: &str = "forbidden";
const ERROR_VALIDATION: &str = "validation_error";

#[derive(Debug, Clone, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

/// Failure response: `{success: false, error: {type, message}}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ErrorBody {
                success: false,
                error: ErrorDetail {
                    kind,
                    message: message.into(),
                },
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.body.error.kind
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_VALIDATION, message)
    }

    pub fn forbidden(role: &str) -> Self {
        ApiError::new(
            StatusCode::FORBIDDEN,
            ERROR_FORBIDDEN,
            format!("role '{role}' is required"),
        )
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<StageError> for ApiError {
    fn from(error: StageError) -> Self {
        if let StageError::Database(e) = &error {
            tracing::error!(error = %e, "stage request failed");
            return ApiError::internal();
        }
        ApiError::new(
            status_from(error.status_code()),
            error.kind().as_str(),
            error.to_string(),
        )
    }
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        if let QueueError::Database(e) = &error {
            tracing::error!(error = %e, "queue request failed");
            return ApiError::internal();
        }
        ApiError::new(status_from(error.status_code()), error.type_str(), error.to_string())
    }
}

impl From<DatabaseError> for ApiError {
    fn from(error: DatabaseError) -> Self {
        tracing::error!(error = %error, "request failed");
        ApiError::internal()
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Queue(e) => e.into(),
            PipelineError::Database(e) => e.into(),
            PipelineError::MissingBatch(_) | PipelineError::Task(_) => {
                tracing::error!(error = %error, "pipeline request failed");
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}
