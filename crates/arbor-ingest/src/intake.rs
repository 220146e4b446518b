//! Batch intake: stores uploaded page images and registers the batch.
//!
//! Files are written one at a time in upload order. Image rows and the batch
//! are registered in one transaction once every object is stored, so a failed
//! upload leaves the slots it would have replaced untouched.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::batch_repo;
use crate::db::image_repo::{self, NewImage};
use crate::db::DatabaseError;
use crate::error::StorageError;
use crate::queue::{BatchDetail, QueueCoordinator, QueueError};
use crate::storage::{object_path, ObjectStore};

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),

    #[error("Failed to store page {page} ('{original_name}'): {source}")]
    Storage {
        page: i64,
        original_name: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// One uploaded page image.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub original_name: String,
    pub bytes: Vec<u8>,
    /// Guessed from the file name when empty.
    pub content_type: String,
}

/// A slot whose previous image was overwritten by this upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSlot {
    pub page: i64,
    pub original_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReport {
    #[serde(flatten)]
    pub detail: BatchDetail,
    pub batch_index: u64,
    pub duplicates: Vec<DuplicateSlot>,
}

pub struct Intake {
    coordinator: QueueCoordinator,
    store: Arc<dyn ObjectStore>,
}

impl Intake {
    pub fn new(coordinator: QueueCoordinator, store: Arc<dyn ObjectStore>) -> Self {
        Self { coordinator, store }
    }

    pub async fn upload_batch(
        &self,
        source_id: &str,
        name: &str,
        files: Vec<UploadFile>,
    ) -> Result<UploadReport, IntakeError> {
        let source_id = source_id.trim();
        if source_id.is_empty() {
            return Err(IntakeError::Validation("sourceId is required".into()));
        }
        if files.is_empty() {
            return Err(IntakeError::Validation("at least one file is required".into()));
        }
        self.coordinator.check_page_count(files.len() as i64)?;

        let uploads = self.coordinator.upload_lock();
        let _uploading = uploads.read().await;

        let db = self.coordinator.db();
        let batch_index = batch_repo::count_for_source(db, source_id)? + 1;

        let mut written: Vec<String> = Vec::with_capacity(files.len());
        let mut content_types: Vec<String> = Vec::with_capacity(files.len());
        for (idx, file) in files.iter().enumerate() {
            let page = idx as i64 + 1;
            let path = object_path(source_id, batch_index, page, &file.original_name);
            let content_type = if file.content_type.trim().is_empty() {
                mime_guess::from_path(&file.original_name)
                    .first_or_octet_stream()
                    .to_string()
            } else {
                file.content_type.clone()
            };

            if let Err(e) = self.store.put(&path, &file.bytes, &content_type).await {
                warn!(source_id, page, error = %e, "upload aborted, rolling back stored objects");
                self.roll_back(&written).await;
                return Err(IntakeError::Storage {
                    page,
                    original_name: file.original_name.clone(),
                    source: e,
                });
            }
            written.push(path);
            content_types.push(content_type);
        }

        let uploaded_at = crate::db::now();
        let registered = self.coordinator.create_batch_with(
            source_id,
            name,
            files.len() as i64,
            |conn| {
                let mut duplicates = Vec::new();
                for (idx, file) in files.iter().enumerate() {
                    let page = idx as i64 + 1;
                    let metadata = json!({
                        "original_filename": file.original_name,
                        "size": file.bytes.len(),
                        "batch_index": batch_index,
                        "uploaded_at": uploaded_at,
                        "content_type": content_types[idx],
                    });
                    let outcome = image_repo::upsert_on(
                        conn,
                        &NewImage {
                            source_id,
                            page,
                            uri: &written[idx],
                            caption: None,
                            metadata: &metadata,
                        },
                        &uploaded_at,
                    )?;
                    if outcome.replaced {
                        duplicates.push(DuplicateSlot {
                            page,
                            original_name: file.original_name.clone(),
                        });
                    }
                }
                Ok(duplicates)
            },
        );
        let (detail, duplicates) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                warn!(source_id, error = %e, "batch registration failed, rolling back stored objects");
                self.roll_back(&written).await;
                return Err(e.into());
            }
        };

        info!(
            batch_id = %detail.batch.id,
            source_id,
            batch_index,
            pages = files.len(),
            duplicates = duplicates.len(),
            "batch uploaded"
        );

        Ok(UploadReport {
            detail,
            batch_index,
            duplicates,
        })
    }

    async fn roll_back(&self, written: &[String]) {
        let report = self.store.remove(written).await;
        for failure in &report.failed {
            warn!(path = %failure.path, error = %failure.error, "failed to remove object during rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::broadcast::QueueEventBroadcaster;
    use crate::db::Database;
    use crate::reconciler::OrphanReconciler;
    use crate::storage::{FilesystemStore, RemoveReport};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    const PUBLIC_BASE: &str = "http://localhost/objects";

    fn file(name: &str) -> UploadFile {
        UploadFile {
            original_name: name.to_string(),
            bytes: b"jpeg-bytes".to_vec(),
            content_type: String::new(),
        }
    }

    fn coordinator() -> QueueCoordinator {
        let db = Database::open_in_memory().expect("Failed to create test database");
        QueueCoordinator::new(db, QueueEventBroadcaster::default())
    }

    #[tokio::test]
    async fn test_upload_creates_batch_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator();
        let store = Arc::new(FilesystemStore::new(dir.path(), PUBLIC_BASE));
        let intake = Intake::new(coordinator.clone(), store);

        let report = intake
            .upload_batch("src-1", "Field notes", vec![file("a.jpg"), file("b c.png")])
            .await
            .unwrap();

        assert_eq!(report.batch_index, 1);
        assert_eq!(report.detail.pages.len(), 2);
        assert!(report.duplicates.is_empty());
        assert!(dir.path().join("src-1/batch-1/page-2-b-c.png").exists());

        let image = image_repo::find_by_slot(coordinator.db(), "src-1", 2).unwrap().unwrap();
        assert_eq!(image.uri, "src-1/batch-1/page-2-b-c.png");
        assert_eq!(image.metadata["original_filename"], "b c.png");
        assert_eq!(image.metadata["content_type"], "image/png");
        assert_eq!(image.metadata["batch_index"], 1);
    }

    #[tokio::test]
    async fn test_second_upload_reports_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator();
        let store = Arc::new(FilesystemStore::new(dir.path(), PUBLIC_BASE));
        let intake = Intake::new(coordinator.clone(), store);

        intake.upload_batch("src-1", "", vec![file("a.jpg")]).await.unwrap();
        let report = intake
            .upload_batch("src-1", "", vec![file("a2.jpg"), file("b.jpg")])
            .await
            .unwrap();

        assert_eq!(report.batch_index, 2);
        assert_eq!(
            report.duplicates,
            vec![DuplicateSlot {
                page: 1,
                original_name: "a2.jpg".into()
            }]
        );
        let image = image_repo::find_by_slot(coordinator.db(), "src-1", 1).unwrap().unwrap();
        assert_eq!(image.uri, "src-1/batch-2/page-1-a2.jpg");
    }

    /// Accepts the first `limit` puts, then fails.
    struct FailingStore {
        inner: FilesystemStore,
        limit: usize,
        puts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
            let n = self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.limit {
                return Err(StorageError::InvalidPath(path.to_string()));
            }
            self.inner.put(path, bytes, content_type).await
        }

        fn public_url(&self, path: &str) -> String {
            self.inner.public_url(path)
        }

        async fn remove(&self, paths: &[String]) -> RemoveReport {
            self.inner.remove(paths).await
        }
    }

    #[tokio::test]
    async fn test_failed_put_rolls_back_without_batch() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator();
        let store = Arc::new(FailingStore {
            inner: FilesystemStore::new(dir.path(), PUBLIC_BASE),
            limit: 1,
            puts: Default::default(),
        });
        let intake = Intake::new(coordinator.clone(), store);

        let err = intake
            .upload_batch("src-1", "", vec![file("a.jpg"), file("b.jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Storage { page: 2, .. }));

        assert!(!dir.path().join("src-1/batch-1/page-1-a.jpg").exists());
        assert!(image_repo::find_by_slot(coordinator.db(), "src-1", 1).unwrap().is_none());
        assert_eq!(batch_repo::count_for_source(coordinator.db(), "src-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_reupload_keeps_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator();
        let store = Arc::new(FailingStore {
            inner: FilesystemStore::new(dir.path(), PUBLIC_BASE),
            limit: 2,
            puts: Default::default(),
        });
        let intake = Intake::new(coordinator.clone(), store);

        intake.upload_batch("src-1", "", vec![file("a.jpg")]).await.unwrap();
        let err = intake
            .upload_batch("src-1", "", vec![file("a2.jpg"), file("b.jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Storage { page: 2, .. }));

        let image = image_repo::find_by_slot(coordinator.db(), "src-1", 1).unwrap().unwrap();
        assert_eq!(image.uri, "src-1/batch-1/page-1-a.jpg");
        assert!(dir.path().join(&image.uri).exists());
        assert!(!dir.path().join("src-1/batch-2/page-1-a2.jpg").exists());
        assert!(image_repo::find_by_slot(coordinator.db(), "src-1", 2).unwrap().is_none());
        assert_eq!(batch_repo::count_for_source(coordinator.db(), "src-1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oversized_upload_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator().with_max_batch_pages(1);
        let store = Arc::new(FilesystemStore::new(dir.path(), PUBLIC_BASE));
        let intake = Intake::new(coordinator.clone(), store);

        let err = intake
            .upload_batch("src-1", "", vec![file("a.jpg"), file("b.jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Queue(QueueError::Validation(_))), "{err:?}");
        assert!(!dir.path().join("src-1/batch-1/page-1-a.jpg").exists());
        assert!(image_repo::find_by_slot(coordinator.db(), "src-1", 1).unwrap().is_none());
    }

    /// Stores objects, then holds each upload until released.
    struct GatedStore {
        inner: FilesystemStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ObjectStore for GatedStore {
        async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
            self.inner.put(path, bytes, content_type).await?;
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        fn public_url(&self, path: &str) -> String {
            self.inner.public_url(path)
        }

        async fn remove(&self, paths: &[String]) -> RemoveReport {
            self.inner.remove(paths).await
        }
    }

    #[tokio::test]
    async fn test_orphan_cleanup_waits_for_running_upload() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator();

        // A deleted batch leaves an orphan in the slot the next upload reuses.
        let plain = Intake::new(
            coordinator.clone(),
            Arc::new(FilesystemStore::new(dir.path(), PUBLIC_BASE)),
        );
        let old = plain.upload_batch("src-1", "", vec![file("a.jpg")]).await.unwrap();
        batch_repo::delete(coordinator.db(), &old.detail.batch.id).unwrap();

        let store = Arc::new(GatedStore {
            inner: FilesystemStore::new(dir.path(), PUBLIC_BASE),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let reconciler = Arc::new(OrphanReconciler::new(&coordinator, store.clone()));
        assert_eq!(reconciler.find_orphans().unwrap().len(), 1);

        let intake = Intake::new(coordinator.clone(), store.clone());
        let upload =
            tokio::spawn(async move { intake.upload_batch("src-1", "", vec![file("a.jpg")]).await });
        store.entered.notified().await;

        let cleaner = Arc::clone(&reconciler);
        let cleanup = tokio::spawn(async move { cleaner.cleanup(None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cleanup.is_finished());

        store.release.notify_one();
        let report = upload.await.unwrap().unwrap();
        assert_eq!(report.duplicates.len(), 1);

        let cleaned = cleanup.await.unwrap().unwrap();
        assert!(cleaned.removed.is_empty());
        let image = image_repo::find_by_slot(coordinator.db(), "src-1", 1).unwrap().unwrap();
        assert!(dir.path().join(&image.uri).exists());
    }

    #[tokio::test]
    async fn test_rejects_empty_upload() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::new(
            coordinator(),
            Arc::new(FilesystemStore::new(dir.path(), PUBLIC_BASE)),
        );
        let err = intake.upload_batch("src-1", "", Vec::new()).await.unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));
    }
}
