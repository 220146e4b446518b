//! Page repository: the `queue_pages` state machine.
//!
//! Every transition is a single UPDATE guarded by the expected source status
//! (and, for pipeline writes, by the `attempt` generation), so a call that
//! finds the page in any other state changes nothing and reports `false`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{Database, DatabaseError, PageStatus, ProcessingPhase};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRow {
    pub id: String,
    pub queue_id: String,
    pub page_number: i64,
    pub status: PageStatus,
    pub processing_phase: Option<ProcessingPhase>,
    pub started_at: Option<String>,
    pub processed_at: Option<String>,
    pub error_message: Option<String>,
    pub extracted_text: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub phase1_completed_at: Option<String>,
    pub phase2_completed_at: Option<String>,
    pub phase3_completed_at: Option<String>,
    pub attempt: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            queue_id: row.get("queue_id")?,
            page_number: row.get("page_number")?,
            status: row.get("status")?,
            processing_phase: row.get("processing_phase")?,
            started_at: row.get("started_at")?,
            processed_at: row.get("processed_at")?,
            error_message: row.get("error_message")?,
            extracted_text: row.get("extracted_text")?,
            ocr_confidence: row.get("ocr_confidence")?,
            phase1_completed_at: row.get("phase1_completed_at")?,
            phase2_completed_at: row.get("phase2_completed_at")?,
            phase3_completed_at: row.get("phase3_completed_at")?,
            attempt: row.get("attempt")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn new_pending(id: &str, queue_id: &str, page_number: i64, now: &str) -> Self {
        Self {
            id: id.to_string(),
            queue_id: queue_id.to_string(),
            page_number,
            status: PageStatus::Pending,
            processing_phase: None,
            started_at: None,
            processed_at: None,
            error_message: None,
            extracted_text: None,
            ocr_confidence: None,
            phase1_completed_at: None,
            phase2_completed_at: None,
            phase3_completed_at: None,
            attempt: 0,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// The first stage whose completion timestamp is missing.
    pub fn next_phase(&self) -> ProcessingPhase {
        if self.phase1_completed_at.is_none() {
            ProcessingPhase::Ocr
        } else if self.phase2_completed_at.is_none() {
            ProcessingPhase::Translation
        } else if self.phase3_completed_at.is_none() {
            ProcessingPhase::Extraction
        } else {
            ProcessingPhase::Done
        }
    }
}

/// Identity a stage uses to address a page: the batch plus the page slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageKey {
    pub queue_id: String,
    pub page_number: i64,
}

/// Optional `attempt` guard. `None` means the write comes from a direct
/// stage call and is not tied to a particular pipeline run.
pub type AttemptGuard = Option<i64>;

pub fn insert_on(conn: &Connection, page: &PageRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO queue_pages (id, queue_id, page_number, status, processing_phase, started_at,
         processed_at, error_message, extracted_text, ocr_confidence, phase1_completed_at,
         phase2_completed_at, phase3_completed_at, attempt, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            page.id,
            page.queue_id,
            page.page_number,
            page.status,
            page.processing_phase,
            page.started_at,
            page.processed_at,
            page.error_message,
            page.extracted_text,
            page.ocr_confidence,
            page.phase1_completed_at,
            page.phase2_completed_at,
            page.phase3_completed_at,
            page.attempt,
            page.created_at,
            page.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_by_id_on(conn: &Connection, id: &str) -> Result<Option<PageRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM queue_pages WHERE id = ?1",
            params![id],
            PageRow::from_row,
        )
        .optional()?)
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| find_by_id_on(conn, id))
}

pub fn find_by_key(db: &Database, key: &PageKey) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM queue_pages WHERE queue_id = ?1 AND page_number = ?2",
                params![key.queue_id, key.page_number],
                PageRow::from_row,
            )
            .optional()?)
    })
}

pub fn list_for_batch_on(conn: &Connection, queue_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM queue_pages WHERE queue_id = ?1 ORDER BY page_number")?;
    let rows = stmt
        .query_map(params![queue_id], PageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All pages of a batch ordered by page number.
pub fn list_for_batch(db: &Database, queue_id: &str) -> Result<Vec<PageRow>, DatabaseError> {
    db.with_conn(|conn| list_for_batch_on(conn, queue_id))
}

/// Moves a `pending` page to `processing` and returns the claimed row.
/// Returns `None` when the page is in any other state.
pub fn claim(db: &Database, id: &str, now: &str) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| claim_on(conn, id, now))
}

fn claim_on(conn: &Connection, id: &str, now: &str) -> Result<Option<PageRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "UPDATE queue_pages SET status = 'processing', started_at = ?2,
             processing_phase = CASE
                 WHEN phase1_completed_at IS NULL THEN 'ocr'
                 WHEN phase2_completed_at IS NULL THEN 'translation'
                 WHEN phase3_completed_at IS NULL THEN 'extraction'
                 ELSE 'done' END,
             error_message = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'pending'
             RETURNING *",
            params![id, now],
            PageRow::from_row,
        )
        .optional()?)
}

/// Claims the next runnable page: the lowest pending page of the oldest
/// batch that has no page currently `processing`. Pages within one batch
/// therefore run one at a time while separate batches may run in parallel.
pub fn claim_next(db: &Database, now: &str) -> Result<Option<PageRow>, DatabaseError> {
    db.with_tx(|conn| {
        let next: Option<String> = conn
            .query_row(
                "SELECT p.id FROM queue_pages p
                 JOIN processing_queue q ON q.id = p.queue_id
                 WHERE p.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM queue_pages busy
                       WHERE busy.queue_id = p.queue_id AND busy.status = 'processing'
                   )
                 ORDER BY q.created_at, q.id, p.page_number
                 LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;

        match next {
            Some(id) => claim_on(conn, &id, now),
            None => Ok(None),
        }
    })
}

/// Outcome of a phase stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageWrite {
    /// The page is missing, a prior phase is unstamped, or the attempt moved on.
    Skipped,
    Stamped,
    /// A direct write cleared later phases of a finished or running page,
    /// which was moved back to `pending` under a new attempt.
    Requeued,
}

/// Records a successful text extraction. Re-extraction clears the later
/// phase stamps so translation and structured extraction run again.
pub fn record_extraction_on(
    conn: &Connection,
    key: &PageKey,
    attempt: AttemptGuard,
    text: &str,
    confidence: f64,
    now: &str,
) -> Result<PageWrite, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_pages SET extracted_text = ?4, ocr_confidence = ?5,
         phase1_completed_at = ?6, phase2_completed_at = NULL, phase3_completed_at = NULL,
         processing_phase = 'translation', updated_at = ?6
         WHERE queue_id = ?1 AND page_number = ?2 AND (?3 IS NULL OR attempt = ?3)",
        params![key.queue_id, key.page_number, attempt, text, confidence, now],
    )?;
    if changed == 0 {
        return Ok(PageWrite::Skipped);
    }
    reopen_if_direct(conn, key, attempt, now)
}

/// Stamps translation completion and clears the structured stamp. No-op
/// unless extraction is stamped.
pub fn stamp_translated_on(
    conn: &Connection,
    key: &PageKey,
    attempt: AttemptGuard,
    now: &str,
) -> Result<PageWrite, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_pages SET phase2_completed_at = ?4, phase3_completed_at = NULL,
         processing_phase = 'extraction', updated_at = ?4
         WHERE queue_id = ?1 AND page_number = ?2 AND (?3 IS NULL OR attempt = ?3)
           AND phase1_completed_at IS NOT NULL",
        params![key.queue_id, key.page_number, attempt, now],
    )?;
    if changed == 0 {
        return Ok(PageWrite::Skipped);
    }
    reopen_if_direct(conn, key, attempt, now)
}

/// Stamps structured-extraction completion. No-op unless translation is stamped.
pub fn stamp_structured_on(
    conn: &Connection,
    key: &PageKey,
    attempt: AttemptGuard,
    now: &str,
) -> Result<PageWrite, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_pages SET phase3_completed_at = ?4, processing_phase = 'done',
         updated_at = ?4
         WHERE queue_id = ?1 AND page_number = ?2 AND (?3 IS NULL OR attempt = ?3)
           AND phase2_completed_at IS NOT NULL",
        params![key.queue_id, key.page_number, attempt, now],
    )?;
    Ok(if changed == 0 {
        PageWrite::Skipped
    } else {
        PageWrite::Stamped
    })
}

/// A direct write that cleared later phases sends a `completed` or
/// `processing` page back to `pending`, so the pipeline finishes it again.
/// Bumping the attempt discards whatever run was in flight.
fn reopen_if_direct(
    conn: &Connection,
    key: &PageKey,
    attempt: AttemptGuard,
    now: &str,
) -> Result<PageWrite, DatabaseError> {
    if attempt.is_some() {
        return Ok(PageWrite::Stamped);
    }
    let reopened = conn.execute(
        "UPDATE queue_pages SET status = 'pending', started_at = NULL, processed_at = NULL,
         error_message = NULL, attempt = attempt + 1, updated_at = ?3
         WHERE queue_id = ?1 AND page_number = ?2 AND status IN ('completed', 'processing')",
        params![key.queue_id, key.page_number, now],
    )?;
    Ok(if reopened > 0 {
        PageWrite::Requeued
    } else {
        PageWrite::Stamped
    })
}

/// `processing → completed` for the claimed attempt.
pub fn complete(db: &Database, id: &str, attempt: i64, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_pages SET status = 'completed', processed_at = ?3,
             error_message = NULL, updated_at = ?3
             WHERE id = ?1 AND attempt = ?2 AND status = 'processing'
               AND phase3_completed_at IS NOT NULL",
            params![id, attempt, now],
        )?;
        Ok(changed > 0)
    })
}

/// `processing → error` for the claimed attempt.
pub fn fail(
    db: &Database,
    id: &str,
    attempt: i64,
    message: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_pages SET status = 'error', error_message = ?3, processed_at = ?4,
             updated_at = ?4
             WHERE id = ?1 AND attempt = ?2 AND status = 'processing'",
            params![id, attempt, message, now],
        )?;
        Ok(changed > 0)
    })
}

/// `error → pending`, clearing the error and processed_at.
pub fn retry(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_pages SET status = 'pending', error_message = NULL,
             processed_at = NULL, started_at = NULL, attempt = attempt + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'error'",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// Bulk `error → pending` for one batch. The status guard leaves pages a
/// concurrent single retry already moved untouched.
pub fn retry_errors_in_batch(db: &Database, queue_id: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE queue_pages SET status = 'pending', error_message = NULL,
             processed_at = NULL, started_at = NULL, attempt = attempt + 1, updated_at = ?2
             WHERE queue_id = ?1 AND status = 'error'",
            params![queue_id, now],
        )?)
    })
}

/// Requeues every page of a batch that is neither `completed` nor `pending`.
pub fn requeue_unfinished(db: &Database, queue_id: &str, now: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE queue_pages SET status = 'pending', error_message = NULL,
             processed_at = NULL, started_at = NULL, attempt = attempt + 1, updated_at = ?2
             WHERE queue_id = ?1 AND status IN ('processing', 'error', 'paused')",
            params![queue_id, now],
        )?)
    })
}

/// `processing → paused`. Bumps the attempt so the in-flight run's result
/// is discarded.
pub fn pause(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_pages SET status = 'paused', attempt = attempt + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// `paused → pending`.
pub fn resume(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_pages SET status = 'pending', started_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'paused'",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// `completed → pending` with every phase stamp cleared.
pub fn reprocess(db: &Database, id: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE queue_pages SET status = 'pending', processed_at = NULL, started_at = NULL,
             error_message = NULL, processing_phase = NULL, phase1_completed_at = NULL,
             phase2_completed_at = NULL, phase3_completed_at = NULL,
             attempt = attempt + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'completed'",
            params![id, now],
        )?;
        Ok(changed > 0)
    })
}

/// The page for `(source_id, page_number)` in the most recently created
/// batch of that source. Used when a stage call omits the queue id.
pub fn find_latest_for_slot(
    db: &Database,
    source_id: &str,
    page_number: i64,
) -> Result<Option<PageRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT p.* FROM queue_pages p
                 JOIN processing_queue q ON q.id = p.queue_id
                 WHERE q.source_id = ?1 AND p.page_number = ?2
                 ORDER BY q.created_at DESC, q.id DESC
                 LIMIT 1",
                params![source_id, page_number],
                PageRow::from_row,
            )
            .optional()?)
    })
}

pub fn delete_for_batch_on(conn: &Connection, queue_id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM queue_pages WHERE queue_id = ?1",
        params![queue_id],
    )?)
}
