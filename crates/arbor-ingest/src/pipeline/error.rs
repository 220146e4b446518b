use thiserror::Error;

use crate::db::DatabaseError;
use crate::queue::QueueError;

/// Failures of the pipeline's own bookkeeping. Stage failures are not
/// errors here: they are recorded on the page.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("batch '{0}' not found for claimed page")]
    MissingBatch(String),

    #[error("{0}")]
    Task(String),
}
