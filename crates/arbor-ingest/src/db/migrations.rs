//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order, each inside its own transaction.

use rusqlite::Connection;

use super::error::DatabaseError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_processing_queue_table",
        sql: include_str!("sql/001_create_processing_queue.sql"),
    },
    Migration {
        version: 2,
        description: "create_queue_pages_table",
        sql: include_str!("sql/002_create_queue_pages.sql"),
    },
    Migration {
        version: 3,
        description: "create_kb_images_table",
        sql: include_str!("sql/003_create_kb_images.sql"),
    },
    Migration {
        version: 4,
        description: "create_kb_chunks_table",
        sql: include_str!("sql/004_create_kb_chunks.sql"),
    },
    Migration {
        version: 5,
        description: "create_page_suggestions_table",
        sql: include_str!("sql/005_create_page_suggestions.sql"),
    },
    Migration {
        version: 6,
        description: "create_catalog_tables",
        sql: include_str!("sql/006_create_catalog.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = migrated();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = migrated();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_queue_pages_has_attempt() {
        let conn = migrated();
        let attempt: i64 = conn
            .query_row(
                "SELECT dflt_value FROM pragma_table_info('queue_pages') WHERE name = 'attempt'",
                [],
                |r| r.get::<_, String>(0),
            )
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(attempt, 0);
    }

    #[test]
    fn test_phase_order_enforced_by_schema() {
        let conn = migrated();
        conn.execute(
            "INSERT INTO processing_queue (id, source_id, name, total_pages, created_at, updated_at)
             VALUES ('q1', 's1', 'Batch', 1, '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO queue_pages (id, queue_id, page_number, phase2_completed_at, created_at, updated_at)
             VALUES ('p1', 'q1', 1, '2026-01-01', '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_suggestion_confidence_floor_enforced_by_schema() {
        let conn = migrated();
        conn.execute_batch(
            "INSERT INTO processing_queue (id, source_id, name, total_pages, created_at, updated_at)
             VALUES ('q1', 's1', 'Batch', 1, '2026-01-01', '2026-01-01');
             INSERT INTO queue_pages (id, queue_id, page_number, created_at, updated_at)
             VALUES ('p1', 'q1', 1, '2026-01-01', '2026-01-01');",
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO page_suggestions (id, queue_id, page_number, suggestion_type, target_table,
             suggested_data, confidence, created_at, updated_at)
             VALUES ('s1', 'q1', 1, 'species', 'species', '{}', 0.4, '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(result.is_err());
    }
}
