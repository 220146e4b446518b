//! Operator-facing queue operations.
//!
//! Every operation is a status-guarded update, so calling it again once it
//! has taken effect changes nothing. After each change the batch's derived
//! progress is recomputed and published.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::aggregate::derive_progress;
use super::QueueError;
use crate::broadcast::{QueueEvent, QueueEventBroadcaster};
use crate::db::batch_repo::{self, BatchProgress, BatchRow};
use crate::db::page_repo::{self, PageRow};
use crate::db::stats_repo::{self, QueueStats, StatusCounts};
use crate::db::{chunk_repo, image_repo, suggestion_repo};
use crate::db::{BatchStatus, Database, DatabaseError, PageStatus};

/// Default for [`QueueCoordinator::with_max_batch_pages`].
pub const DEFAULT_MAX_BATCH_PAGES: i64 = 2000;

/// A batch together with its pages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetail {
    pub batch: BatchRow,
    pub pages: Vec<PageRow>,
}

/// Result of a single-page operation. `changed` is false when the page was
/// already in the target state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAction {
    pub page: PageRow,
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartReport {
    pub pages_reset: usize,
    pub chunks_removed: usize,
    pub suggestions_removed: u64,
}

#[derive(Clone)]
pub struct QueueCoordinator {
    db: Database,
    events: QueueEventBroadcaster,
    wake: Arc<Notify>,
    uploads: Arc<RwLock<()>>,
    max_batch_pages: i64,
}

impl QueueCoordinator {
    pub fn new(db: Database, events: QueueEventBroadcaster) -> Self {
        Self {
            db,
            events,
            wake: Arc::new(Notify::new()),
            uploads: Arc::new(RwLock::new(())),
            max_batch_pages: DEFAULT_MAX_BATCH_PAGES,
        }
    }

    pub fn with_max_batch_pages(mut self, max_batch_pages: i64) -> Self {
        self.max_batch_pages = max_batch_pages.max(1);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &QueueEventBroadcaster {
        &self.events
    }

    /// Signal workers wait on for newly runnable pages.
    pub fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn wake(&self) {
        self.wake.notify_waiters();
    }

    pub(crate) fn check_page_count(&self, page_count: i64) -> Result<(), QueueError> {
        if (1..=self.max_batch_pages).contains(&page_count) {
            Ok(())
        } else {
            Err(QueueError::Validation(format!(
                "pageCount must be between 1 and {}, got {page_count}",
                self.max_batch_pages
            )))
        }
    }

    /// Uploads hold this shared while they store and register images;
    /// orphan cleanup holds it exclusively.
    pub fn upload_lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.uploads)
    }

    /// Publishes a batch after a direct stage call sent one of its pages
    /// back to `pending`.
    pub fn page_requeued(&self, batch_id: &str) -> Result<(), QueueError> {
        self.recompute(batch_id)?;
        self.wake();
        Ok(())
    }

    /// Creates a batch and its `page_count` pending pages in one transaction.
    pub fn create_batch(
        &self,
        source_id: &str,
        name: &str,
        page_count: i64,
    ) -> Result<BatchDetail, QueueError> {
        self.create_batch_with(source_id, name, page_count, |_| Ok(()))
            .map(|(detail, ())| detail)
    }

    /// Like [`Self::create_batch`], running `register` in the same
    /// transaction before the batch row is written.
    pub(crate) fn create_batch_with<T, F>(
        &self,
        source_id: &str,
        name: &str,
        page_count: i64,
        register: F,
    ) -> Result<(BatchDetail, T), QueueError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let source_id = source_id.trim();
        if source_id.is_empty() {
            return Err(QueueError::Validation("sourceId is required".into()));
        }
        self.check_page_count(page_count)?;
        let name = match name.trim() {
            "" => source_id,
            n => n,
        };

        let now = crate::db::now();
        let batch = BatchRow::new_pending(&uuid::Uuid::new_v4().to_string(), source_id, name, page_count, &now);
        let (pages, registered) = self.db.with_tx(|conn| {
            let registered = register(conn)?;
            batch_repo::insert_on(conn, &batch)?;
            let mut pages = Vec::new();
            for n in 1..=page_count {
                let page = PageRow::new_pending(&uuid::Uuid::new_v4().to_string(), &batch.id, n, &now);
                page_repo::insert_on(conn, &page)?;
                pages.push(page);
            }
            Ok((pages, registered))
        })?;

        info!(batch_id = %batch.id, source_id, pages = page_count, "batch created");
        self.events.send(QueueEvent::BatchUpdated {
            batch: batch.clone(),
        });
        self.wake();
        Ok((BatchDetail { batch, pages }, registered))
    }

    pub fn batch_detail(&self, batch_id: &str) -> Result<BatchDetail, QueueError> {
        let batch = self.require_batch(batch_id)?;
        let pages = page_repo::list_for_batch(&self.db, batch_id)?;
        Ok(BatchDetail { batch, pages })
    }

    fn require_batch(&self, batch_id: &str) -> Result<BatchRow, QueueError> {
        batch_repo::find_by_id(&self.db, batch_id)?.ok_or_else(|| QueueError::NotFound {
            entity: "batch",
            id: batch_id.to_string(),
        })
    }

    fn require_page(&self, page_id: &str) -> Result<PageRow, QueueError> {
        page_repo::find_by_id(&self.db, page_id)?.ok_or_else(|| QueueError::NotFound {
            entity: "page",
            id: page_id.to_string(),
        })
    }

    /// Rebuilds a batch's progress columns from its pages and publishes the
    /// result. Returns `None` when the batch no longer exists.
    pub fn recompute(&self, batch_id: &str) -> Result<Option<BatchRow>, QueueError> {
        let updated = self.db.with_tx(|conn| {
            let Some(batch) = batch_repo::find_by_id_on(conn, batch_id)? else {
                return Ok(None);
            };
            let pages = page_repo::list_for_batch_on(conn, batch_id)?;
            let mut progress = derive_progress(&batch, &pages, Utc::now());
            if let Some(page) = progress.current_page {
                progress.current_file = image_repo::original_filename_on(conn, &batch.source_id, page)?;
            }
            let now = crate::db::now();
            batch_repo::update_progress_on(conn, batch_id, &progress, &now)?;
            batch_repo::find_by_id_on(conn, batch_id)
        })?;

        if let Some(batch) = &updated {
            debug!(
                batch_id,
                status = %batch.status,
                processed = batch.processed_pages,
                total = batch.total_pages,
                "batch progress recomputed"
            );
            self.events.send(QueueEvent::BatchUpdated {
                batch: batch.clone(),
            });
        }
        Ok(updated)
    }

    fn page_action(
        &self,
        page_id: &str,
        action: &'static str,
        allowed_from: PageStatus,
        already: PageStatus,
        apply: fn(&Database, &str, &str) -> Result<bool, crate::db::DatabaseError>,
    ) -> Result<PageAction, QueueError> {
        let page = self.require_page(page_id)?;
        if page.status == already {
            debug!(page_id, action, "page already in target state");
            return Ok(PageAction { page, changed: false });
        }
        if page.status != allowed_from {
            return Err(QueueError::InvalidTransition {
                action,
                entity: "page",
                id: page_id.to_string(),
                status: page.status.to_string(),
            });
        }

        let changed = apply(&self.db, page_id, &crate::db::now())?;
        if changed {
            info!(page_id, queue_id = %page.queue_id, page = page.page_number, action, "page updated");
            self.recompute(&page.queue_id)?;
            if already == PageStatus::Pending {
                self.wake();
            }
        }
        let page = self.require_page(page_id)?;
        Ok(PageAction { page, changed })
    }

    /// `error → pending`. A page already pending is left alone.
    pub fn retry_page(&self, page_id: &str) -> Result<PageAction, QueueError> {
        self.page_action(page_id, "retry", PageStatus::Error, PageStatus::Pending, page_repo::retry)
    }

    /// `processing → paused`.
    pub fn pause_page(&self, page_id: &str) -> Result<PageAction, QueueError> {
        self.page_action(page_id, "pause", PageStatus::Processing, PageStatus::Paused, page_repo::pause)
    }

    /// `paused → pending`.
    pub fn resume_page(&self, page_id: &str) -> Result<PageAction, QueueError> {
        self.page_action(page_id, "resume", PageStatus::Paused, PageStatus::Pending, page_repo::resume)
    }

    /// `completed → pending` with all phases cleared.
    pub fn reprocess_page(&self, page_id: &str) -> Result<PageAction, QueueError> {
        self.page_action(
            page_id,
            "reprocess",
            PageStatus::Completed,
            PageStatus::Pending,
            page_repo::reprocess,
        )
    }

    /// Requeues every page currently in `error`. Returns the number requeued.
    pub fn retry_all_errors(&self, batch_id: &str) -> Result<usize, QueueError> {
        self.require_batch(batch_id)?;
        let requeued = page_repo::retry_errors_in_batch(&self.db, batch_id, &crate::db::now())?;
        info!(batch_id, requeued, "requeued failed pages");
        if requeued > 0 {
            self.recompute(batch_id)?;
            self.wake();
        }
        Ok(requeued)
    }

    /// Requeues every unfinished page (processing, error or paused) while
    /// leaving completed pages alone.
    pub fn force_restart(&self, batch_id: &str) -> Result<usize, QueueError> {
        let batch = self.require_batch(batch_id)?;
        let counts = stats_repo::page_counts(&self.db, Some(batch_id))?;
        if counts.completed == counts.total {
            return Err(QueueError::InvalidTransition {
                action: "force-restart",
                entity: "batch",
                id: batch_id.to_string(),
                status: batch.status.to_string(),
            });
        }

        let requeued = page_repo::requeue_unfinished(&self.db, batch_id, &crate::db::now())?;
        info!(batch_id, requeued, "force-restarted unfinished pages");
        self.recompute(batch_id)?;
        if requeued > 0 || counts.pending > 0 {
            self.wake();
        }
        Ok(requeued)
    }

    /// Discards every page's progress, chunk and suggestions and returns the
    /// batch to its original pending baseline. Requires `confirmed`.
    pub fn restart_entire_batch(
        &self,
        batch_id: &str,
        confirmed: bool,
    ) -> Result<RestartReport, QueueError> {
        if !confirmed {
            return Err(QueueError::ConfirmationRequired);
        }
        let batch = self.require_batch(batch_id)?;

        let now = crate::db::now();
        let report = self.db.with_tx(|conn| {
            let pages = page_repo::list_for_batch_on(conn, batch_id)?;
            let numbers: Vec<i64> = pages.iter().map(|p| p.page_number).collect();

            let suggestions_removed = suggestion_repo::count_for_batch_on(conn, batch_id)?;
            let chunks_removed = chunk_repo::delete_for_pages_on(conn, &batch.source_id, &numbers)?;
            page_repo::delete_for_batch_on(conn, batch_id)?;

            // Fresh rows carry a newer attempt so in-flight results are dropped.
            for old in &pages {
                let mut page = PageRow::new_pending(
                    &uuid::Uuid::new_v4().to_string(),
                    batch_id,
                    old.page_number,
                    &now,
                );
                page.attempt = old.attempt + 1;
                page_repo::insert_on(conn, &page)?;
            }

            let baseline = BatchProgress {
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
            };
            batch_repo::update_progress_on(conn, batch_id, &baseline, &now)?;

            Ok(RestartReport {
                pages_reset: pages.len(),
                chunks_removed,
                suggestions_removed,
            })
        })?;

        warn!(
            batch_id,
            pages = report.pages_reset,
            chunks = report.chunks_removed,
            suggestions = report.suggestions_removed,
            "batch restarted from scratch"
        );
        self.recompute(batch_id)?;
        self.wake();
        Ok(report)
    }

    /// Page counts for one batch, recomputed from page rows.
    pub fn batch_stats(&self, batch_id: &str) -> Result<StatusCounts, QueueError> {
        self.require_batch(batch_id)?;
        Ok(stats_repo::page_counts(&self.db, Some(batch_id))?)
    }

    pub fn global_stats(&self) -> Result<QueueStats, QueueError> {
        Ok(stats_repo::queue_stats(&self.db)?)
    }
}
