//! Stored-image repository for `kb_images`, keyed by `(source_id, page)`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRow {
    pub id: String,
    pub source_id: String,
    pub page: i64,
    pub uri: String,
    pub caption: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

impl ImageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let metadata: String = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            page: row.get("page")?,
            uri: row.get("uri")?,
            caption: row.get("caption")?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for [`upsert_on`].
#[derive(Debug, Clone)]
pub struct NewImage<'a> {
    pub source_id: &'a str,
    pub page: i64,
    pub uri: &'a str,
    pub caption: Option<&'a str>,
    pub metadata: &'a serde_json::Value,
}

/// Result of an upsert: the row id and whether an existing slot was overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: String,
    pub replaced: bool,
}

/// Inserts or overwrites the image in slot `(source_id, page)`. The row id
/// of an existing slot is kept.
pub fn upsert_on(
    conn: &Connection,
    image: &NewImage<'_>,
    now: &str,
) -> Result<UpsertOutcome, DatabaseError> {
    let metadata = serde_json::to_string(image.metadata).map_err(|e| DatabaseError::Json {
        column: "metadata",
        source: e,
    })?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM kb_images WHERE source_id = ?1 AND page = ?2",
            params![image.source_id, image.page],
            |r| r.get(0),
        )
        .optional()?;

    let id = existing
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    conn.execute(
        "INSERT INTO kb_images (id, source_id, page, uri, caption, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(source_id, page) DO UPDATE SET
           uri = excluded.uri,
           caption = excluded.caption,
           metadata = excluded.metadata,
           updated_at = excluded.updated_at",
        params![id, image.source_id, image.page, image.uri, image.caption, metadata, now],
    )?;

    Ok(UpsertOutcome {
        id,
        replaced: existing.is_some(),
    })
}

pub fn find_by_slot(db: &Database, source_id: &str, page: i64) -> Result<Option<ImageRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM kb_images WHERE source_id = ?1 AND page = ?2",
                params![source_id, page],
                ImageRow::from_row,
            )
            .optional()?)
    })
}

/// Sets one top-level key of the metadata blob, keeping the others.
/// Returns `false` when the slot has no image row.
pub fn set_metadata_key_on(
    conn: &Connection,
    source_id: &str,
    page: i64,
    key: &str,
    value: &serde_json::Value,
    now: &str,
) -> Result<bool, DatabaseError> {
    let value = serde_json::to_string(value).map_err(|e| DatabaseError::Json {
        column: "metadata",
        source: e,
    })?;
    let path = format!("$.{}", key);
    let changed = conn.execute(
        "UPDATE kb_images SET metadata = json_set(metadata, ?3, json(?4)), updated_at = ?5
         WHERE source_id = ?1 AND page = ?2",
        params![source_id, page, path, value, now],
    )?;
    Ok(changed > 0)
}

/// `metadata.original_filename` of a slot, when recorded.
pub fn original_filename_on(
    conn: &Connection,
    source_id: &str,
    page: i64,
) -> Result<Option<String>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT json_extract(metadata, '$.original_filename') FROM kb_images
             WHERE source_id = ?1 AND page = ?2",
            params![source_id, page],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

/// Image rows whose source has no batch row at all.
pub fn find_orphans(db: &Database) -> Result<Vec<ImageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM kb_images i
             WHERE NOT EXISTS (SELECT 1 FROM processing_queue q WHERE q.source_id = i.source_id)
             ORDER BY i.source_id, i.page",
        )?;
        let rows = stmt
            .query_map([], ImageRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes an image row only while it is still an orphan.
pub fn delete_if_orphan(db: &Database, source_id: &str, page: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM kb_images
             WHERE source_id = ?1 AND page = ?2
               AND NOT EXISTS (SELECT 1 FROM processing_queue q WHERE q.source_id = ?1)",
            params![source_id, page],
        )?;
        Ok(changed > 0)
    })
}
