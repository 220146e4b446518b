//! Shared harness for integration tests: in-memory database, a temp-dir
//! object store and scripted stage backends.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tokio::sync::Notify;

use arbor_ingest::broadcast::QueueEventBroadcaster;
use arbor_ingest::config::{ServerConfig, StageConfig};
use arbor_ingest::db::batch_repo::{self, BatchRow};
use arbor_ingest::db::page_repo::{self, PageRow};
use arbor_ingest::db::Database;
use arbor_ingest::intake::{Intake, UploadFile, UploadReport};
use arbor_ingest::pipeline::{Pipeline, ProcessReport};
use arbor_ingest::queue::QueueCoordinator;
use arbor_ingest::reconciler::OrphanReconciler;
use arbor_ingest::retry::RetryPolicy;
use arbor_ingest::server::{build_api_router, AppState};
use arbor_ingest::stages::{
    ImageProbe, ProbeError, RawSuggestion, Recognition, StageContext, StageError,
    StructuredExtractionStage, StructuredExtractor, TextExtractionStage, TextRecognizer,
    TranslationStage, Translation, Translator,
};
use arbor_ingest::storage::FilesystemStore;

pub const PUBLIC_BASE: &str = "http://127.0.0.1:8787/objects";

pub const GERMAN_TEXT: &str = "Die Linde (Tilia cordata) zeigt am Stammfuss eine Höhlung \
von 30 cm Tiefe. Der Baum ist mit Brandkrustenpilz befallen.";

/// Recognizer whose reply is derived from the image URL. URLs containing a
/// registered marker produce the mapped text; everything else yields
/// [`GERMAN_TEXT`].
pub struct ScriptedRecognizer {
    texts: Mutex<Vec<(String, String)>>,
    pub calls: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    pub entered: Arc<Notify>,
}

impl ScriptedRecognizer {
    fn new() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn respond(&self, marker: &str, text: &str) {
        self.texts.lock().unwrap().push((marker.to_string(), text.to_string()));
    }

    /// Makes every recognition wait until the returned handle is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Lets later recognitions run without waiting.
    pub fn release(&self) {
        *self.gate.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextRecognizer for ScriptedRecognizer {
    async fn recognize(&self, image_url: &str) -> Result<Recognition, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let text = self
            .texts
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, _)| image_url.contains(marker.as_str()))
            .map(|(_, text)| text.clone())
            .unwrap_or_else(|| GERMAN_TEXT.to_string());
        Ok(Recognition {
            text,
            confidence: Some(0.92),
            language: None,
        })
    }
}

/// Translator that prefixes the content so tests can see it ran.
pub struct EchoTranslator {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Translator for EchoTranslator {
    async fn translate(
        &self,
        content: &str,
        detected_language: Option<&str>,
        target_language: &str,
    ) -> Result<Translation, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Translation {
            translated_content: format!("[{target_language}] {content}"),
            detected_language: detected_language.unwrap_or("de").to_string(),
            confidence: 0.88,
        })
    }
}

/// Extractor returning a fixed list of suggestions.
pub struct ScriptedExtractor {
    suggestions: Mutex<Vec<RawSuggestion>>,
    pub calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn set(&self, suggestions: Vec<RawSuggestion>) {
        *self.suggestions.lock().unwrap() = suggestions;
    }
}

#[async_trait]
impl StructuredExtractor for ScriptedExtractor {
    async fn extract(&self, _content: &str) -> Result<Vec<RawSuggestion>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.suggestions.lock().unwrap().clone())
    }
}

/// Probe that reports 404 for URLs containing a blocked marker.
#[derive(Default)]
pub struct ScriptedProbe {
    blocked: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    pub fn block(&self, marker: &str) {
        self.blocked.lock().unwrap().insert(marker.to_string());
    }

    pub fn unblock_all(&self) {
        self.blocked.lock().unwrap().clear();
    }
}

#[async_trait]
impl ImageProbe for ScriptedProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let blocked = self.blocked.lock().unwrap();
        if blocked.iter().any(|m| url.contains(m.as_str())) {
            Err(ProbeError::NotFound(404))
        } else {
            Ok(())
        }
    }
}

pub fn suggestion(table: &str, data: serde_json::Value, confidence: f64) -> RawSuggestion {
    RawSuggestion {
        target_table: table.to_string(),
        data,
        confidence,
        rationale: Some("stated in the text".to_string()),
    }
}

pub fn jpeg(name: &str) -> UploadFile {
    UploadFile {
        original_name: name.to_string(),
        bytes: format!("fake-jpeg:{name}").into_bytes(),
        content_type: "image/jpeg".to_string(),
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub db: Database,
    pub store: Arc<FilesystemStore>,
    pub coordinator: QueueCoordinator,
    pub pipeline: Arc<Pipeline>,
    pub intake: Intake,
    pub reconciler: Arc<OrphanReconciler>,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub translator: Arc<EchoTranslator>,
    pub extractor: Arc<ScriptedExtractor>,
    pub probe: Arc<ScriptedProbe>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(StageConfig::default())
    }

    pub fn with_config(config: StageConfig) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Database::open_in_memory().expect("Failed to create test database");
        let store = Arc::new(FilesystemStore::new(dir.path(), PUBLIC_BASE));
        let coordinator = QueueCoordinator::new(db.clone(), QueueEventBroadcaster::default());

        let recognizer = Arc::new(ScriptedRecognizer::new());
        let translator = Arc::new(EchoTranslator {
            calls: AtomicUsize::new(0),
        });
        let extractor = Arc::new(ScriptedExtractor {
            suggestions: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let probe = Arc::new(ScriptedProbe::default());

        let ctx = StageContext {
            queue: coordinator.clone(),
            store: store.clone(),
            config,
        };
        let pipeline = Arc::new(Pipeline::new(
            coordinator.clone(),
            TextExtractionStage::new(
                ctx.clone(),
                recognizer.clone(),
                probe.clone(),
                RetryPolicy::immediate(3),
            ),
            TranslationStage::new(ctx.clone(), translator.clone()),
            StructuredExtractionStage::new(ctx, extractor.clone()),
        ));

        let intake = Intake::new(coordinator.clone(), store.clone());
        let reconciler = Arc::new(OrphanReconciler::new(&coordinator, store.clone()));

        Self {
            dir,
            db,
            store,
            coordinator,
            pipeline,
            intake,
            reconciler,
            recognizer,
            translator,
            extractor,
            probe,
        }
    }

    pub fn router(&self) -> Router {
        build_api_router(
            AppState::new(Arc::clone(&self.pipeline), Arc::clone(&self.reconciler)),
            &ServerConfig::default(),
        )
    }

    pub async fn upload(&self, source_id: &str, names: &[&str]) -> UploadReport {
        let files = names.iter().map(|n| jpeg(n)).collect();
        self.intake
            .upload_batch(source_id, "", files)
            .await
            .expect("upload should succeed")
    }

    /// Processes pages until the queue is idle.
    pub async fn drain(&self) -> Vec<ProcessReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.pipeline.process_next().await.expect("process_next") {
            reports.push(report);
        }
        reports
    }

    pub fn batch(&self, id: &str) -> BatchRow {
        batch_repo::find_by_id(&self.db, id)
            .expect("batch lookup")
            .expect("batch exists")
    }

    pub fn pages(&self, batch_id: &str) -> Vec<PageRow> {
        page_repo::list_for_batch(&self.db, batch_id).expect("page lookup")
    }

    pub fn page(&self, batch_id: &str, number: i64) -> PageRow {
        self.pages(batch_id)
            .into_iter()
            .find(|p| p.page_number == number)
            .expect("page exists")
    }
}
