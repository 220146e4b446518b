//! The three per-page processing stages and their backends.
//!
//! Each stage is callable on its own (the HTTP function routes) and from
//! the pipeline. A stage checks its backend configuration first, then the
//! page's phase prerequisites, then does its work. Its results and the
//! attempt-guarded phase stamp are written in one transaction, stamp first,
//! so a superseded run writes nothing.

pub mod error;
pub mod extract;
pub mod language;
pub mod llm;
pub mod ocr;
pub mod probe;
pub mod suggestion;
pub mod translate;

use std::sync::Arc;

pub use error::{ErrorKind, StageError, UnreachableCause};
pub use extract::{ExtractOutcome, ExtractRequest, LlmStructuredExtractor, StructuredExtractionStage, StructuredExtractor};
pub use ocr::{OcrOutcome, OcrRequest, Recognition, TextExtractionStage, TextRecognizer, VisionRecognizer};
pub use probe::{HttpProbe, ImageProbe, ProbeError};
pub use suggestion::{ConfidenceBand, RawSuggestion, SuggestedData};
pub use translate::{LlmTranslator, TranslateOutcome, TranslateRequest, Translation, TranslationStage, Translator};

use tracing::{info, warn};

use crate::config::StageConfig;
use crate::db::batch_repo;
use crate::db::page_repo::{self, AttemptGuard, PageKey, PageRow, PageWrite};
use crate::db::Database;
use crate::queue::QueueCoordinator;
use crate::storage::ObjectStore;

/// Shared handles every stage needs.
#[derive(Clone)]
pub struct StageContext {
    pub queue: QueueCoordinator,
    pub store: Arc<dyn ObjectStore>,
    pub config: StageConfig,
}

impl StageContext {
    pub fn db(&self) -> &Database {
        self.queue.db()
    }

    /// Publishes a page a direct stage call sent back to the queue. The
    /// write is already committed, so a failed refresh is only logged.
    pub(crate) fn page_written(&self, page: &PageRow, write: PageWrite) {
        if write != PageWrite::Requeued {
            return;
        }
        info!(
            queue_id = %page.queue_id,
            page_number = page.page_number,
            "page reopened, later phases will run again"
        );
        if let Err(e) = self.queue.page_requeued(&page.queue_id) {
            warn!(queue_id = %page.queue_id, error = %e, "failed to refresh batch after reopening page");
        }
    }
}

/// Finds the page a stage call writes to. An explicit `queue_id` must name a
/// batch of `source_id` that has the page; without one the most recent
/// batch holding the slot is used, and `None` means no batch holds it.
pub(crate) fn resolve_page(
    db: &Database,
    queue_id: Option<&str>,
    source_id: &str,
    page_number: i64,
) -> Result<Option<PageRow>, StageError> {
    let Some(queue_id) = queue_id.filter(|q| !q.trim().is_empty()) else {
        return Ok(page_repo::find_latest_for_slot(db, source_id, page_number)?);
    };

    let batch = batch_repo::find_by_id(db, queue_id)?.ok_or_else(|| StageError::NotFound {
        entity: "batch",
        id: queue_id.to_string(),
    })?;
    if batch.source_id != source_id {
        return Err(StageError::Validation(format!(
            "batch '{queue_id}' belongs to source '{}', not '{source_id}'",
            batch.source_id
        )));
    }

    let key = PageKey {
        queue_id: queue_id.to_string(),
        page_number,
    };
    page_repo::find_by_key(db, &key)?
        .map(Some)
        .ok_or_else(|| StageError::NotFound {
            entity: "page",
            id: format!("{queue_id}/{page_number}"),
        })
}

/// Rejects a pipeline write whose claimed attempt is no longer current.
pub(crate) fn ensure_current(page: &PageRow, attempt: AttemptGuard) -> Result<(), StageError> {
    match attempt {
        Some(expected) if expected != page.attempt => Err(superseded(page)),
        _ => Ok(()),
    }
}

pub(crate) fn superseded(page: &PageRow) -> StageError {
    StageError::Superseded {
        queue_id: page.queue_id.clone(),
        page_number: page.page_number,
    }
}

pub(crate) fn page_key(page: &PageRow) -> PageKey {
    PageKey {
        queue_id: page.queue_id.clone(),
        page_number: page.page_number,
    }
}
