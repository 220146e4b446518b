use serde::Serialize;
use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachableCause {
    NotFound,
    Timeout,
}

impl std::fmt::Display for UnreachableCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnreachableCause::NotFound => write!(f, "not found"),
            UnreachableCause::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error category reported to callers as `error.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    ResourceUnreachable,
    BackendError,
    ConfigurationError,
    OutOfOrder,
    NotFound,
    Superseded,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::ResourceUnreachable => "resource_unreachable",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::OutOfOrder => "out_of_order",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Superseded => "superseded",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("image unreachable ({cause}): {url}: {detail}")]
    Unreachable {
        cause: UnreachableCause,
        url: String,
        detail: String,
    },

    #[error("{provider} backend error: {message}")]
    Backend { provider: String, message: String },

    #[error("recognition backend returned no text")]
    EmptyRecognition,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{stage} requires {missing} to be completed first")]
    OutOfOrder {
        stage: &'static str,
        missing: &'static str,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The page was reset while this call was in flight; the result is discarded.
    #[error("page {queue_id}/{page_number} was reset during processing")]
    Superseded { queue_id: String, page_number: i64 },

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl StageError {
    pub fn backend(provider: &str, message: impl Into<String>) -> Self {
        StageError::Backend {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::ValidationError,
            StageError::Unreachable { .. } => ErrorKind::ResourceUnreachable,
            StageError::Backend { .. } | StageError::EmptyRecognition => ErrorKind::BackendError,
            StageError::Configuration(_) => ErrorKind::ConfigurationError,
            StageError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            StageError::NotFound { .. } => ErrorKind::NotFound,
            StageError::Superseded { .. } => ErrorKind::Superseded,
            StageError::Database(_) => ErrorKind::InternalError,
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StageError::Validation(_) => 400,
            StageError::Unreachable {
                cause: UnreachableCause::NotFound,
                ..
            } => 404,
            StageError::Unreachable {
                cause: UnreachableCause::Timeout,
                ..
            } => 408,
            StageError::Backend { .. } | StageError::EmptyRecognition => 502,
            StageError::Configuration(_) => 500,
            StageError::OutOfOrder { .. } | StageError::Superseded { .. } => 409,
            StageError::NotFound { .. } => 404,
            StageError::Database(_) => 500,
        }
    }
}
