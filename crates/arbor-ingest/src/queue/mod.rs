//! Queue coordinator: batch/page state machine and derived batch progress.

pub mod aggregate;
pub mod coordinator;

use thiserror::Error;

use crate::db::DatabaseError;

pub use coordinator::{BatchDetail, PageAction, QueueCoordinator, RestartReport};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("cannot {action} {entity} '{id}' in status '{status}'")]
    InvalidTransition {
        action: &'static str,
        entity: &'static str,
        id: String,
        status: String,
    },

    #[error("restarting a batch discards all of its progress; resend with confirm set to true")]
    ConfirmationRequired,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl QueueError {
    pub fn type_str(&self) -> &'static str {
        match self {
            QueueError::NotFound { .. } => "not_found",
            QueueError::InvalidTransition { .. } => "conflict",
            QueueError::ConfirmationRequired | QueueError::Validation(_) => "validation_error",
            QueueError::Database(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            QueueError::NotFound { .. } => 404,
            QueueError::InvalidTransition { .. } => 409,
            QueueError::ConfirmationRequired | QueueError::Validation(_) => 400,
            QueueError::Database(_) => 500,
        }
    }
}
