//! Batch repository: CRUD operations for the `processing_queue` table.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{BatchStatus, Database, DatabaseError};

/// A batch (job) row. Progress columns are derived from page rows and only
/// written through [`update_progress_on`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRow {
    pub id: String,
    pub source_id: String,
    pub name: String,
    pub total_pages: i64,
    pub processed_pages: i64,
    pub percentage: f64,
    pub status: BatchStatus,
    pub current_stage: Option<String>,
    pub current_file: Option<String>,
    pub current_page: Option<i64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub estimated_completion: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BatchRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            name: row.get("name")?,
            total_pages: row.get("total_pages")?,
            processed_pages: row.get("processed_pages")?,
            percentage: row.get("percentage")?,
            status: row.get("status")?,
            current_stage: row.get("current_stage")?,
            current_file: row.get("current_file")?,
            current_page: row.get("current_page")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            estimated_completion: row.get("estimated_completion")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// A fresh `pending` batch with no progress.
    pub fn new_pending(id: &str, source_id: &str, name: &str, total_pages: i64, now: &str) -> Self {
        Self {
            id: id.to_string(),
            source_id: source_id.to_string(),
            name: name.to_string(),
            total_pages,
            processed_pages: 0,
            percentage: 0.0,
            status: BatchStatus::Pending,
            current_stage: Some("Queued".to_string()),
            current_file: None,
            current_page: None,
            started_at: None,
            completed_at: None,
            estimated_completion: None,
            error_message: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }
}

/// Derived progress columns, recomputed from page rows.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub processed_pages: i64,
    pub percentage: f64,
    pub status: BatchStatus,
    pub current_stage: Option<String>,
    pub current_file: Option<String>,
    pub current_page: Option<i64>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub estimated_completion: Option<String>,
    pub error_message: Option<String>,
}

pub fn insert_on(conn: &Connection, batch: &BatchRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO processing_queue (id, source_id, name, total_pages, processed_pages,
         percentage, status, current_stage, current_file, current_page, started_at,
         completed_at, estimated_completion, error_message, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            batch.id,
            batch.source_id,
            batch.name,
            batch.total_pages,
            batch.processed_pages,
            batch.percentage,
            batch.status,
            batch.current_stage,
            batch.current_file,
            batch.current_page,
            batch.started_at,
            batch.completed_at,
            batch.estimated_completion,
            batch.error_message,
            batch.created_at,
            batch.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_by_id_on(conn: &Connection, id: &str) -> Result<Option<BatchRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM processing_queue WHERE id = ?1",
            params![id],
            BatchRow::from_row,
        )
        .optional()?)
}

/// Finds a batch by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<BatchRow>, DatabaseError> {
    db.with_conn(|conn| find_by_id_on(conn, id))
}

/// Number of batches ever registered for a source.
pub fn count_for_source(db: &Database, source_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM processing_queue WHERE source_id = ?1",
            params![source_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Writes the derived progress columns of a batch.
pub fn update_progress_on(
    conn: &Connection,
    id: &str,
    progress: &BatchProgress,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_queue SET processed_pages = ?2, percentage = ?3, status = ?4,
         current_stage = ?5, current_file = ?6, current_page = ?7, started_at = ?8,
         completed_at = ?9, estimated_completion = ?10, error_message = ?11, updated_at = ?12
         WHERE id = ?1",
        params![
            id,
            progress.processed_pages,
            progress.percentage,
            progress.status,
            progress.current_stage,
            progress.current_file,
            progress.current_page,
            progress.started_at,
            progress.completed_at,
            progress.estimated_completion,
            progress.error_message,
            updated_at,
        ],
    )?;
    Ok(changed > 0)
}

/// Deletes a batch row. Pages and their suggestions cascade.
pub fn delete(db: &Database, id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "DELETE FROM processing_queue WHERE id = ?1",
            params![id],
        )?)
    })
}
