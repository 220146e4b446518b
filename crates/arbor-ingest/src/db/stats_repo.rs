//! Queue statistics, always recomputed from page rows.

use rusqlite::{params, Connection};
use serde::Serialize;

use super::{BatchStatus, Database, DatabaseError, PageStatus};

/// Page counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub error: u64,
    pub paused: u64,
    pub total: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: PageStatus, count: u64) {
        match status {
            PageStatus::Pending => self.pending += count,
            PageStatus::Processing => self.processing += count,
            PageStatus::Completed => self.completed += count,
            PageStatus::Error => self.error += count,
            PageStatus::Paused => self.paused += count,
        }
        self.total += count;
    }
}

/// Global view: page counts plus batch counts per derived status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pages: StatusCounts,
    pub batches: u64,
    pub batches_by_status: std::collections::BTreeMap<String, u64>,
}

pub fn page_counts_on(conn: &Connection, queue_id: Option<&str>) -> Result<StatusCounts, DatabaseError> {
    let mut counts = StatusCounts::default();
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM queue_pages
         WHERE (?1 IS NULL OR queue_id = ?1)
         GROUP BY status",
    )?;
    let rows = stmt.query_map(params![queue_id], |r| {
        Ok((r.get::<_, PageStatus>(0)?, r.get::<_, u64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        counts.add(status, count);
    }
    Ok(counts)
}

/// Page counts for one batch, or across all batches when `queue_id` is `None`.
pub fn page_counts(db: &Database, queue_id: Option<&str>) -> Result<StatusCounts, DatabaseError> {
    db.with_conn(|conn| page_counts_on(conn, queue_id))
}

pub fn queue_stats(db: &Database) -> Result<QueueStats, DatabaseError> {
    db.with_conn(|conn| {
        let pages = page_counts_on(conn, None)?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM processing_queue GROUP BY status")?;
        let mut stats = QueueStats {
            pages,
            ..Default::default()
        };
        let rows = stmt.query_map([], |r| Ok((r.get::<_, BatchStatus>(0)?, r.get::<_, u64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            stats.batches += count;
            stats
                .batches_by_status
                .insert(status.as_str().to_string(), count);
        }
        Ok(stats)
    })
}
