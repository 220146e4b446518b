use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::db::batch_repo::{self, BatchRow};
use crate::db::page_repo::{self, PageRow};
use crate::db::{chunk_repo, image_repo, ProcessingPhase};
use crate::queue::QueueCoordinator;
use crate::retry::RetryPolicy;
use crate::stages::{
    ExtractRequest, HttpProbe, LlmStructuredExtractor, LlmTranslator, OcrRequest, StageContext,
    StageError, StructuredExtractionStage, TextExtractionStage, TranslateRequest, TranslationStage,
    VisionRecognizer,
};
use crate::storage::ObjectStore;

use super::error::PipelineError;
use super::progress::{BroadcastProgress, ProgressEvent, ProgressReporter};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageOutcome {
    Completed,
    Failed { message: String },
    /// The page was reset while running; the result was discarded.
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub page_id: String,
    pub queue_id: String,
    pub page_number: i64,
    pub outcome: PageOutcome,
}

pub struct Pipeline {
    coordinator: QueueCoordinator,
    ocr: TextExtractionStage,
    translation: TranslationStage,
    extraction: StructuredExtractionStage,
}

fn following(phase: ProcessingPhase) -> ProcessingPhase {
    match phase {
        ProcessingPhase::Ocr => ProcessingPhase::Translation,
        ProcessingPhase::Translation => ProcessingPhase::Extraction,
        ProcessingPhase::Extraction | ProcessingPhase::Done => ProcessingPhase::Done,
    }
}

impl Pipeline {
    pub fn new(
        coordinator: QueueCoordinator,
        ocr: TextExtractionStage,
        translation: TranslationStage,
        extraction: StructuredExtractionStage,
    ) -> Self {
        Self {
            coordinator,
            ocr,
            translation,
            extraction,
        }
    }

    /// Production constructor: builds the HTTP-backed stages from config.
    pub fn from_config(
        config: &Config,
        coordinator: QueueCoordinator,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, StageError> {
        let ctx = StageContext {
            queue: coordinator.clone(),
            store,
            config: config.stages.clone(),
        };
        let probe = HttpProbe::new(Duration::from_secs(config.retry.probe_timeout_secs.max(1)))?;
        let ocr = TextExtractionStage::new(
            ctx.clone(),
            Arc::new(VisionRecognizer::new(&config.backends.ocr)?),
            Arc::new(probe),
            RetryPolicy::from_config(&config.retry),
        );
        let translation =
            TranslationStage::new(ctx.clone(), Arc::new(LlmTranslator::new(&config.backends.translation)?));
        let extraction = StructuredExtractionStage::new(
            ctx,
            Arc::new(LlmStructuredExtractor::new(&config.backends.extraction)?),
        );
        Ok(Self::new(coordinator, ocr, translation, extraction))
    }

    pub fn coordinator(&self) -> &QueueCoordinator {
        &self.coordinator
    }

    pub fn ocr(&self) -> &TextExtractionStage {
        &self.ocr
    }

    pub fn translation(&self) -> &TranslationStage {
        &self.translation
    }

    pub fn extraction(&self) -> &StructuredExtractionStage {
        &self.extraction
    }

    /// Claims and processes the next runnable page. `None` when the queue is idle.
    pub async fn process_next(self: &Arc<Self>) -> Result<Option<ProcessReport>, PipelineError> {
        let db = self.coordinator.db();
        match page_repo::claim_next(db, &crate::db::now())? {
            Some(page) => Ok(Some(self.run_detached(page).await?)),
            None => Ok(None),
        }
    }

    /// Claims `page_id` and runs its remaining stages. `None` when the page
    /// is not pending.
    pub async fn process_page(self: &Arc<Self>, page_id: &str) -> Result<Option<ProcessReport>, PipelineError> {
        let db = self.coordinator.db();
        match page_repo::claim(db, page_id, &crate::db::now())? {
            Some(page) => Ok(Some(self.run_detached(page).await?)),
            None => Ok(None),
        }
    }

    /// Runs a claimed page on its own task, so a caller that goes away does
    /// not leave the page `processing`. A run that ends in an error instead
    /// of an outcome marks the page `error`.
    async fn run_detached(self: &Arc<Self>, page: PageRow) -> Result<ProcessReport, PipelineError> {
        let pipeline = Arc::clone(self);
        let claimed = page.clone();
        let run = tokio::spawn(async move {
            let result = pipeline.run_claimed(page.clone()).await;
            if let Err(e) = &result {
                pipeline.abandon(&page, &e.to_string());
            }
            result
        });
        match run.await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("page run aborted: {e}");
                self.abandon(&claimed, &message);
                Err(PipelineError::Task(message))
            }
        }
    }

    /// Moves a claimed page to `error` under its attempt guard and refreshes
    /// the batch. Pages that were reset meanwhile are left alone.
    fn abandon(&self, page: &PageRow, message: &str) {
        let db = self.coordinator.db();
        match page_repo::fail(db, &page.id, page.attempt, message, &crate::db::now()) {
            Ok(true) => warn!(page_id = %page.id, error = %message, "claimed page abandoned"),
            Ok(false) => {}
            Err(e) => error!(page_id = %page.id, error = %e, "failed to release abandoned page"),
        }
        if let Err(e) = self.coordinator.recompute(&page.queue_id) {
            error!(queue_id = %page.queue_id, error = %e, "failed to refresh batch after abandoning page");
        }
    }

    async fn run_claimed(&self, page: PageRow) -> Result<ProcessReport, PipelineError> {
        let span = info_span!(
            "pipeline",
            queue_id = %page.queue_id,
            page_number = page.page_number,
            attempt = page.attempt,
        );
        self.run_claimed_inner(page).instrument(span).await
    }

    async fn run_claimed_inner(&self, page: PageRow) -> Result<ProcessReport, PipelineError> {
        let db = self.coordinator.db();
        let batch = batch_repo::find_by_id(db, &page.queue_id)?
            .ok_or_else(|| PipelineError::MissingBatch(page.queue_id.clone()))?;
        let progress = BroadcastProgress::new(self.coordinator.events().track_page(
            &page.id,
            &page.queue_id,
            page.page_number,
        ));
        self.coordinator.recompute(&page.queue_id)?;

        let result = self.run_stages(&batch, &page, &progress).await;

        let now = crate::db::now();
        let outcome = match result {
            Ok(()) => {
                if page_repo::complete(db, &page.id, page.attempt, &now)? {
                    progress.report(ProgressEvent::Completed);
                    info!("page completed");
                    PageOutcome::Completed
                } else {
                    info!("page was reset during processing, result discarded");
                    PageOutcome::Superseded
                }
            }
            Err((_, StageError::Superseded { .. })) => {
                info!("page was reset during processing, result discarded");
                PageOutcome::Superseded
            }
            Err((phase, e)) => {
                let message = e.to_string();
                if page_repo::fail(db, &page.id, page.attempt, &message, &now)? {
                    warn!(phase = %phase, error = %message, "page failed");
                    progress.report(ProgressEvent::Failed {
                        phase,
                        error: message.clone(),
                    });
                    PageOutcome::Failed { message }
                } else {
                    info!("page was reset during processing, failure discarded");
                    PageOutcome::Superseded
                }
            }
        };

        self.coordinator.recompute(&page.queue_id)?;
        Ok(ProcessReport {
            page_id: page.id,
            queue_id: page.queue_id,
            page_number: page.page_number,
            outcome,
        })
    }

    /// Runs every stage from the page's first unfinished phase onward.
    async fn run_stages(
        &self,
        batch: &BatchRow,
        page: &PageRow,
        progress: &dyn ProgressReporter,
    ) -> Result<(), (ProcessingPhase, StageError)> {
        let mut phase = page.next_phase();
        while phase != ProcessingPhase::Done {
            progress.report(ProgressEvent::Phase { phase });
            self.run_stage(phase, batch, page)
                .await
                .map_err(|e| (phase, e))?;
            phase = following(phase);
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        phase: ProcessingPhase,
        batch: &BatchRow,
        page: &PageRow,
    ) -> Result<(), StageError> {
        let db = self.coordinator.db();
        let slot = format!("{}/{}", batch.source_id, page.page_number);
        match phase {
            ProcessingPhase::Ocr => {
                let image = image_repo::find_by_slot(db, &batch.source_id, page.page_number)?
                    .ok_or_else(|| StageError::NotFound {
                        entity: "image",
                        id: slot,
                    })?;
                self.ocr
                    .run(&OcrRequest {
                        image_url: image.uri,
                        source_id: batch.source_id.clone(),
                        page: page.page_number,
                        queue_id: Some(page.queue_id.clone()),
                        attempt: Some(page.attempt),
                    })
                    .await?;
            }
            ProcessingPhase::Translation | ProcessingPhase::Extraction => {
                let chunk = chunk_repo::find_by_slot(db, &batch.source_id, page.page_number)?
                    .ok_or_else(|| StageError::NotFound {
                        entity: "chunk",
                        id: slot,
                    })?;
                if phase == ProcessingPhase::Translation {
                    self.translation
                        .run(&TranslateRequest {
                            chunk_id: chunk.id,
                            content: None,
                            detected_language: None,
                            queue_id: Some(page.queue_id.clone()),
                            attempt: Some(page.attempt),
                        })
                        .await?;
                } else {
                    self.extraction
                        .run(&ExtractRequest {
                            chunk_id: chunk.id,
                            queue_id: Some(page.queue_id.clone()),
                            attempt: Some(page.attempt),
                        })
                        .await?;
                }
            }
            ProcessingPhase::Done => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert_eq!(following(ProcessingPhase::Ocr), ProcessingPhase::Translation);
        assert_eq!(following(ProcessingPhase::Translation), ProcessingPhase::Extraction);
        assert_eq!(following(ProcessingPhase::Extraction), ProcessingPhase::Done);
    }

    #[tokio::test]
    async fn test_finished_page_runs_no_stage() {
        use super::super::progress::NoopProgress;
        use crate::broadcast::QueueEventBroadcaster;
        use crate::db::Database;
        use crate::storage::FilesystemStore;

        const T0: &str = "2026-01-01T00:00:00.000000Z";
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().expect("Failed to create test database");
        let coordinator = QueueCoordinator::new(db, QueueEventBroadcaster::default());
        let store = Arc::new(FilesystemStore::new(dir.path(), "http://localhost/objects"));
        let pipeline = Pipeline::from_config(&Config::default(), coordinator, store).unwrap();

        let batch = BatchRow::new_pending("b1", "src", "Batch", 1, T0);
        let mut page = PageRow::new_pending("p1", "b1", 1, T0);
        page.phase1_completed_at = Some(T0.to_string());
        page.phase2_completed_at = Some(T0.to_string());
        page.phase3_completed_at = Some(T0.to_string());

        // Nothing is stored, so any stage call would fail.
        assert!(pipeline.run_stages(&batch, &page, &NoopProgress).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_page_is_released_as_error() {
        use crate::broadcast::QueueEventBroadcaster;
        use crate::db::{BatchStatus, Database, PageStatus};
        use crate::storage::FilesystemStore;

        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().expect("Failed to create test database");
        let coordinator = QueueCoordinator::new(db.clone(), QueueEventBroadcaster::default());
        let detail = coordinator.create_batch("src", "Batch", 1).unwrap();
        let store = Arc::new(FilesystemStore::new(dir.path(), "http://localhost/objects"));
        let pipeline = Pipeline::from_config(&Config::default(), coordinator, store).unwrap();

        let claimed = page_repo::claim_next(&db, &crate::db::now()).unwrap().unwrap();
        pipeline.abandon(&claimed, "batch vanished");

        let page = page_repo::find_by_id(&db, &claimed.id).unwrap().unwrap();
        assert_eq!(page.status, PageStatus::Error);
        assert_eq!(page.error_message.as_deref(), Some("batch vanished"));
        let batch = batch_repo::find_by_id(&db, &detail.batch.id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Error);

        // A retried page carries a new attempt, so a late abandon is ignored.
        page_repo::retry(&db, &claimed.id, &crate::db::now()).unwrap();
        pipeline.abandon(&claimed, "late");
        let page = page_repo::find_by_id(&db, &claimed.id).unwrap().unwrap();
        assert_eq!(page.status, PageStatus::Pending);
    }
}
