//! Content-chunk repository for `kb_chunks`.
//!
//! A chunk is created by text extraction and then only updated in place.
//! `(source_id, page)` identifies the chunk of a page slot; `content_hash`
//! is the dedup key and is a pure function of the raw content.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRow {
    pub id: String,
    pub source_id: String,
    pub page: i64,
    pub content: String,
    pub content_en: Option<String>,
    pub source_language: Option<String>,
    pub target_language: String,
    pub content_hash: String,
    pub image_ids: Vec<String>,
    pub metadata: serde_json::Value,
    pub species_ids: Vec<String>,
    pub defect_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn json_list(row: &Row<'_>, column: &str) -> Result<Vec<String>, rusqlite::Error> {
    let raw: String = row.get(column)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

impl ChunkRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let metadata: String = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            source_id: row.get("source_id")?,
            page: row.get("page")?,
            content: row.get("content")?,
            content_en: row.get("content_en")?,
            source_language: row.get("source_language")?,
            target_language: row.get("target_language")?,
            content_hash: row.get("content_hash")?,
            image_ids: json_list(row, "image_ids")?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            species_ids: json_list(row, "species_ids")?,
            defect_ids: json_list(row, "defect_ids")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Lowercase hex SHA-256 of the raw content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Extraction output written by [`upsert_extracted_on`].
#[derive(Debug, Clone)]
pub struct ExtractedChunk<'a> {
    pub source_id: &'a str,
    pub page: i64,
    pub content: &'a str,
    pub source_language: &'a str,
    pub target_language: &'a str,
    pub image_ids: &'a [String],
    pub metadata: &'a serde_json::Value,
}

fn encode<T: Serialize>(column: &'static str, value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Json { column, source: e })
}

/// Creates the page's chunk, or replaces its text when one already exists.
/// The chunk id is kept on replacement and the stale translation is cleared.
/// Returns the row and whether it was newly created.
pub fn upsert_extracted_on(
    conn: &Connection,
    chunk: &ExtractedChunk<'_>,
    now: &str,
) -> Result<(ChunkRow, bool), DatabaseError> {
    let image_ids = encode("image_ids", &chunk.image_ids)?;
    let metadata = encode("metadata", chunk.metadata)?;
    let hash = content_hash(chunk.content);

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM kb_chunks WHERE source_id = ?1 AND page = ?2",
            params![chunk.source_id, chunk.page],
            |r| r.get(0),
        )
        .optional()?;
    let created = existing.is_none();
    let id = existing.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let row = conn.query_row(
        "INSERT INTO kb_chunks (id, source_id, page, content, source_language, target_language,
         content_hash, image_ids, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(source_id, page) DO UPDATE SET
           content = excluded.content,
           content_en = NULL,
           source_language = excluded.source_language,
           target_language = excluded.target_language,
           content_hash = excluded.content_hash,
           image_ids = excluded.image_ids,
           metadata = excluded.metadata,
           updated_at = excluded.updated_at
         RETURNING *",
        params![
            id,
            chunk.source_id,
            chunk.page,
            chunk.content,
            chunk.source_language,
            chunk.target_language,
            hash,
            image_ids,
            metadata,
            now,
        ],
        ChunkRow::from_row,
    )?;
    Ok((row, created))
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<ChunkRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row("SELECT * FROM kb_chunks WHERE id = ?1", params![id], ChunkRow::from_row)
            .optional()?)
    })
}

pub fn find_by_slot(db: &Database, source_id: &str, page: i64) -> Result<Option<ChunkRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM kb_chunks WHERE source_id = ?1 AND page = ?2",
                params![source_id, page],
                ChunkRow::from_row,
            )
            .optional()?)
    })
}

/// Number of chunks whose raw content hashes to `hash`.
pub fn count_by_hash(db: &Database, hash: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM kb_chunks WHERE content_hash = ?1",
            params![hash],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Stores the normalized translation and the detected source language.
pub fn set_translation_on(
    conn: &Connection,
    id: &str,
    content_en: &str,
    source_language: &str,
    translation: &serde_json::Value,
    now: &str,
) -> Result<bool, DatabaseError> {
    let translation = encode("metadata", translation)?;
    let changed = conn.execute(
        "UPDATE kb_chunks SET content_en = ?2, source_language = ?3,
         metadata = json_set(metadata, '$.translation', json(?4)), updated_at = ?5
         WHERE id = ?1",
        params![id, content_en, source_language, translation, now],
    )?;
    Ok(changed > 0)
}

/// Records the structured-extraction summary under `metadata.extraction`.
pub fn set_extraction_metadata_on(
    conn: &Connection,
    id: &str,
    summary: &serde_json::Value,
    now: &str,
) -> Result<bool, DatabaseError> {
    let summary = encode("metadata", summary)?;
    let changed = conn.execute(
        "UPDATE kb_chunks SET metadata = json_set(metadata, '$.extraction', json(?2)),
         updated_at = ?3 WHERE id = ?1",
        params![id, summary, now],
    )?;
    Ok(changed > 0)
}

/// Deletes the chunks of the given page slots of one source.
pub fn delete_for_pages_on(
    conn: &Connection,
    source_id: &str,
    pages: &[i64],
) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare("DELETE FROM kb_chunks WHERE source_id = ?1 AND page = ?2")?;
    let mut removed = 0;
    for page in pages {
        removed += stmt.execute(params![source_id, page])?;
    }
    Ok(removed)
}
