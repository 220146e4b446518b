//! Suggestion repository for `page_suggestions`.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{Database, DatabaseError, SuggestionStatus, SuggestionType};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionRow {
    pub id: String,
    pub queue_id: String,
    pub page_number: i64,
    pub chunk_id: Option<String>,
    pub suggestion_type: SuggestionType,
    pub target_table: String,
    pub suggested_data: serde_json::Value,
    pub confidence: f64,
    pub status: SuggestionStatus,
    pub rationale: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SuggestionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let data: String = row.get("suggested_data")?;
        Ok(Self {
            id: row.get("id")?,
            queue_id: row.get("queue_id")?,
            page_number: row.get("page_number")?,
            chunk_id: row.get("chunk_id")?,
            suggestion_type: row.get("suggestion_type")?,
            target_table: row.get("target_table")?,
            suggested_data: serde_json::from_str(&data).unwrap_or_default(),
            confidence: row.get("confidence")?,
            status: row.get("status")?,
            rationale: row.get("rationale")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Replaces the page's `pending` suggestions with `rows`. Approved and
/// rejected suggestions from earlier runs are kept. Run it inside a
/// transaction so a rejected row leaves the old set in place.
pub fn replace_pending_for_page_on(
    conn: &Connection,
    queue_id: &str,
    page_number: i64,
    rows: &[SuggestionRow],
) -> Result<usize, DatabaseError> {
    let mut encoded = Vec::with_capacity(rows.len());
    for row in rows {
        let data = serde_json::to_string(&row.suggested_data).map_err(|e| DatabaseError::Json {
            column: "suggested_data",
            source: e,
        })?;
        encoded.push(data);
    }

    conn.execute(
        "DELETE FROM page_suggestions
         WHERE queue_id = ?1 AND page_number = ?2 AND status = 'pending'",
        params![queue_id, page_number],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO page_suggestions (id, queue_id, page_number, chunk_id, suggestion_type,
         target_table, suggested_data, confidence, status, rationale, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;
    for (row, data) in rows.iter().zip(&encoded) {
        stmt.execute(params![
            row.id,
            queue_id,
            page_number,
            row.chunk_id,
            row.suggestion_type,
            row.target_table,
            data,
            row.confidence,
            row.status,
            row.rationale,
            row.created_at,
            row.updated_at,
        ])?;
    }
    Ok(rows.len())
}

pub fn list_for_page(
    db: &Database,
    queue_id: &str,
    page_number: i64,
) -> Result<Vec<SuggestionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM page_suggestions WHERE queue_id = ?1 AND page_number = ?2
             ORDER BY confidence DESC, created_at",
        )?;
        let rows = stmt
            .query_map(params![queue_id, page_number], SuggestionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn list_for_batch(db: &Database, queue_id: &str) -> Result<Vec<SuggestionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM page_suggestions WHERE queue_id = ?1 ORDER BY page_number, confidence DESC",
        )?;
        let rows = stmt
            .query_map(params![queue_id], SuggestionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_for_batch_on(conn: &Connection, queue_id: &str) -> Result<u64, DatabaseError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM page_suggestions WHERE queue_id = ?1",
        params![queue_id],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Curator decision on a suggestion. Only `pending` suggestions change.
pub fn set_status(
    db: &Database,
    id: &str,
    status: SuggestionStatus,
    now: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE page_suggestions SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, status, now],
        )?;
        Ok(changed > 0)
    })
}
