//! Orphan reconciler: removes stored images whose source has no batch.
//!
//! Deleting a batch does not cascade to `kb_images`, so its images linger
//! and block the page slots. Cleanup deletes the blob first and the row
//! second; a failed blob delete is reported but never keeps the row.
//! Cleanup waits for running uploads, which may be rewriting the same paths.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::db::{image_repo, Database, DatabaseError};
use crate::queue::QueueCoordinator;
use crate::storage::{storage_path, ObjectStore, RemoveFailure};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanRecord {
    pub source_id: String,
    pub page: i64,
    pub uri: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub removed: Vec<OrphanRecord>,
    pub storage_failures: Vec<RemoveFailure>,
    /// Another cleanup was already running; nothing was done.
    pub skipped: bool,
}

pub struct OrphanReconciler {
    db: Database,
    store: Arc<dyn ObjectStore>,
    /// Prevents concurrent cleanups from racing on the same rows.
    cleanup_lock: Mutex<()>,
    /// Shared with intake; held exclusively while removing.
    uploads: Arc<RwLock<()>>,
}

impl OrphanReconciler {
    pub fn new(coordinator: &QueueCoordinator, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            db: coordinator.db().clone(),
            store,
            cleanup_lock: Mutex::new(()),
            uploads: coordinator.upload_lock(),
        }
    }

    pub fn find_orphans(&self) -> Result<Vec<OrphanRecord>, DatabaseError> {
        Ok(image_repo::find_orphans(&self.db)?
            .into_iter()
            .map(|image| OrphanRecord {
                source_id: image.source_id,
                page: image.page,
                uri: image.uri,
            })
            .collect())
    }

    /// Removes every orphan, or only those in `subset`. Records that are no
    /// longer orphans (a batch was created for the source meanwhile) are
    /// left alone.
    pub async fn cleanup(
        &self,
        subset: Option<&[OrphanRecord]>,
    ) -> Result<CleanupReport, DatabaseError> {
        let _guard = match self.cleanup_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::info!("Orphan cleanup skipped: another cleanup is already in progress");
                return Ok(CleanupReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        };
        let _no_uploads = self.uploads.write().await;

        let mut targets = self.find_orphans()?;
        if let Some(subset) = subset {
            targets.retain(|t| {
                subset
                    .iter()
                    .any(|s| s.source_id == t.source_id && s.page == t.page)
            });
        }
        if targets.is_empty() {
            log::debug!("No orphaned images to clean up");
            return Ok(CleanupReport::default());
        }

        let paths: Vec<String> = targets
            .iter()
            .filter_map(|t| storage_path(self.store.as_ref(), &t.uri))
            .collect();
        let storage = self.store.remove(&paths).await;
        for failure in &storage.failed {
            log::warn!(
                "Failed to delete orphaned object '{}': {}",
                failure.path,
                failure.error
            );
        }

        let mut report = CleanupReport {
            storage_failures: storage.failed,
            ..Default::default()
        };
        for target in targets {
            if image_repo::delete_if_orphan(&self.db, &target.source_id, target.page)? {
                report.removed.push(target);
            }
        }

        log::info!(
            "Orphan cleanup removed {} image row(s), {} storage failure(s)",
            report.removed.len(),
            report.storage_failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::batch_repo::{self, BatchRow};
    use crate::broadcast::QueueEventBroadcaster;
    use crate::db::image_repo::NewImage;
    use crate::storage::FilesystemStore;
    use serde_json::json;

    const T0: &str = "2026-01-01T00:00:00.000000Z";

    fn setup() -> (tempfile::TempDir, Database, Arc<FilesystemStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().expect("Failed to create test database");
        let store = Arc::new(FilesystemStore::new(dir.path(), "http://127.0.0.1:8787/objects"));
        (dir, db, store)
    }

    fn reconciler(db: &Database, store: Arc<FilesystemStore>) -> OrphanReconciler {
        let coordinator = QueueCoordinator::new(db.clone(), QueueEventBroadcaster::default());
        OrphanReconciler::new(&coordinator, store)
    }

    async fn put_image(db: &Database, store: &FilesystemStore, source_id: &str, page: i64) -> String {
        let path = format!("{source_id}/batch-1/page-{page}-scan.jpg");
        store.put(&path, b"jpeg", "image/jpeg").await.unwrap();
        let metadata = json!({});
        db.with_tx(|conn| {
            image_repo::upsert_on(
                conn,
                &NewImage {
                    source_id,
                    page,
                    uri: &path,
                    caption: None,
                    metadata: &metadata,
                },
                T0,
            )
        })
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_cleanup_with_no_orphans_is_noop() {
        let (_dir, db, store) = setup();
        let reconciler = reconciler(&db, store);
        let report = reconciler.cleanup(None).await.unwrap();
        assert!(report.removed.is_empty());
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_cleanup_removes_blob_and_row_and_converges() {
        let (dir, db, store) = setup();
        let orphan_path = put_image(&db, &store, "gone", 1).await;
        put_image(&db, &store, "kept", 1).await;
        db.with_conn(|conn| batch_repo::insert_on(conn, &BatchRow::new_pending("b1", "kept", "Kept", 1, T0)))
            .unwrap();

        let reconciler = reconciler(&db, store);
        let orphans = reconciler.find_orphans().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].source_id, "gone");

        let report = reconciler.cleanup(None).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!dir.path().join(&orphan_path).exists());
        assert!(image_repo::find_by_slot(&db, "kept", 1).unwrap().is_some());

        assert!(reconciler.find_orphans().unwrap().is_empty());
        assert!(reconciler.cleanup(None).await.unwrap().removed.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_subset_only_touches_listed_records() {
        let (_dir, db, store) = setup();
        put_image(&db, &store, "gone", 1).await;
        put_image(&db, &store, "gone", 2).await;
        let reconciler = reconciler(&db, store);

        let subset = vec![OrphanRecord {
            source_id: "gone".into(),
            page: 2,
            uri: String::new(),
        }];
        let report = reconciler.cleanup(Some(&subset)).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.removed[0].page, 2);
        assert_eq!(reconciler.find_orphans().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_blob_still_removes_row() {
        let (dir, db, store) = setup();
        let path = put_image(&db, &store, "gone", 1).await;
        std::fs::remove_file(dir.path().join(&path)).unwrap();

        let reconciler = reconciler(&db, store);
        let report = reconciler.cleanup(None).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(report.storage_failures.is_empty());
    }
}
