//! Text extraction: page image to raw text, confidence and language.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, Instrument};

use super::error::StageError;
use super::language::{detect_language, estimate_confidence, normalize_language};
use super::llm::{parse_json_reply, ChatClient, ChatMessage};
use super::probe::{ensure_reachable, ImageProbe};
use super::{ensure_current, page_key, resolve_page, superseded, StageContext};
use crate::broadcast::QueueEvent;
use crate::config::BackendConfig;
use crate::db::chunk_repo::{self, ExtractedChunk};
use crate::db::page_repo::{self, AttemptGuard, PageWrite};
use crate::db::image_repo;
use crate::retry::RetryPolicy;
use crate::sanitize::redact_url;
use crate::storage::resolve_url;

/// Raw output of a recognition backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: Option<f64>,
    pub language: Option<String>,
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Fails with a configuration error when the backend cannot be used.
    fn check_config(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn recognize(&self, image_url: &str) -> Result<Recognition, StageError>;
}

const OCR_PROMPT: &str = "You transcribe scanned tree-inspection and arboriculture documents. \
Return every piece of text on the page exactly as written, keeping line breaks, \
scientific names, units and measurements unchanged. Do not translate or summarize. \
Reply with a JSON object: {\"text\": string, \"language\": ISO 639-1 code, \
\"confidence\": number between 0 and 1}.";

/// Recognition through a vision-capable chat-completions model.
pub struct VisionRecognizer {
    client: ChatClient,
}

impl VisionRecognizer {
    pub fn new(config: &BackendConfig) -> Result<Self, StageError> {
        Ok(Self {
            client: ChatClient::new("ocr", config)?,
        })
    }
}

#[derive(Deserialize)]
struct RecognitionReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    language: Option<String>,
}

#[async_trait]
impl TextRecognizer for VisionRecognizer {
    fn check_config(&self) -> Result<(), StageError> {
        self.client.api_key().map(|_| ())
    }

    async fn recognize(&self, image_url: &str) -> Result<Recognition, StageError> {
        let messages = [
            ChatMessage::system(OCR_PROMPT),
            ChatMessage::user_with_image("Transcribe this page.", image_url),
        ];
        let reply = self.client.complete_json(&messages).await?;
        let recognition = match parse_json_reply(self.client.provider(), &reply) {
            Ok(value) => {
                let parsed: RecognitionReply = serde_json::from_value(value).map_err(|e| {
                    StageError::backend(self.client.provider(), format!("unexpected reply shape: {e}"))
                })?;
                Recognition {
                    text: parsed.text,
                    confidence: parsed.confidence,
                    language: parsed.language,
                }
            }
            // Some models ignore JSON mode for image prompts and answer in plain text.
            Err(_) => Recognition {
                text: reply,
                ..Default::default()
            },
        };
        Ok(recognition)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrRequest {
    pub image_url: String,
    pub source_id: String,
    pub page: i64,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(skip)]
    pub attempt: AttemptGuard,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrOutcome {
    pub chunk_id: String,
    pub chunk_created: bool,
    pub text: String,
    pub confidence: f64,
    pub detected_language: String,
    pub image_url: String,
}

pub struct TextExtractionStage {
    ctx: StageContext,
    recognizer: Arc<dyn TextRecognizer>,
    probe: Arc<dyn ImageProbe>,
    retry: RetryPolicy,
}

impl TextExtractionStage {
    pub fn new(
        ctx: StageContext,
        recognizer: Arc<dyn TextRecognizer>,
        probe: Arc<dyn ImageProbe>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ctx,
            recognizer,
            probe,
            retry,
        }
    }

    pub async fn run(&self, req: &OcrRequest) -> Result<OcrOutcome, StageError> {
        let span = tracing::info_span!("ocr", source_id = %req.source_id, page = req.page);
        self.run_inner(req).instrument(span).await
    }

    async fn run_inner(&self, req: &OcrRequest) -> Result<OcrOutcome, StageError> {
        if req.image_url.trim().is_empty() {
            return Err(StageError::Validation("imageUrl is required".into()));
        }
        if req.source_id.trim().is_empty() {
            return Err(StageError::Validation("sourceId is required".into()));
        }
        if req.page < 1 {
            return Err(StageError::Validation(format!("page must be >= 1, got {}", req.page)));
        }
        self.recognizer.check_config()?;

        let db = self.ctx.db();
        let page = resolve_page(db, req.queue_id.as_deref(), &req.source_id, req.page)?;
        if let Some(page) = &page {
            ensure_current(page, req.attempt)?;
        }

        let url = resolve_url(self.ctx.store.as_ref(), req.image_url.trim());
        ensure_reachable(self.probe.as_ref(), &self.retry, &url).await?;
        debug!(url = %redact_url(&url), "image reachable");

        let recognition = self.recognizer.recognize(&url).await?;
        let text = recognition.text.trim().to_string();
        if text.is_empty() {
            return Err(StageError::EmptyRecognition);
        }
        let confidence = recognition
            .confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or_else(|| estimate_confidence(&text));
        let language = recognition
            .language
            .as_deref()
            .and_then(normalize_language)
            .unwrap_or_else(|| detect_language(&text, &self.ctx.config.target_language));

        let now = crate::db::now();
        let image = image_repo::find_by_slot(db, &req.source_id, req.page)?;
        let image_ids: Vec<String> = image.iter().map(|i| i.id.clone()).collect();
        let chunk_metadata = json!({ "ocr": { "confidence": confidence, "imageUrl": url } });
        let ocr_metadata = json!({
            "confidence": confidence,
            "language": language,
            "length": text.chars().count(),
            "processedAt": now,
        });

        // Stamp first: a page reset while recognition ran gets no chunk write.
        let (chunk, created, write) = db.with_tx(|conn| {
            let write = match &page {
                Some(page) => {
                    let write = page_repo::record_extraction_on(
                        conn,
                        &page_key(page),
                        req.attempt,
                        &text,
                        confidence,
                        &now,
                    )?;
                    if write == PageWrite::Skipped && req.attempt.is_some() {
                        return Ok(Err(superseded(page)));
                    }
                    Some(write)
                }
                None => None,
            };
            image_repo::set_metadata_key_on(conn, &req.source_id, req.page, "ocr", &ocr_metadata, &now)?;
            let (chunk, created) = chunk_repo::upsert_extracted_on(
                conn,
                &ExtractedChunk {
                    source_id: &req.source_id,
                    page: req.page,
                    content: &text,
                    source_language: &language,
                    target_language: &self.ctx.config.target_language,
                    image_ids: &image_ids,
                    metadata: &chunk_metadata,
                },
                &now,
            )?;
            Ok(Ok((chunk, created, write)))
        })??;
        if let (Some(page), Some(write)) = (&page, write) {
            self.ctx.page_written(page, write);
        }

        let length = text.chars().count();
        if length > self.ctx.config.chunk_ready_chars {
            self.ctx.queue.events().send(QueueEvent::ChunkReady {
                chunk_id: chunk.id.clone(),
                source_id: chunk.source_id.clone(),
                page: chunk.page,
                length,
            });
        }

        info!(
            chunk_id = %chunk.id,
            created,
            confidence,
            language = %language,
            length,
            "text extracted"
        );

        Ok(OcrOutcome {
            chunk_id: chunk.id,
            chunk_created: created,
            text,
            confidence,
            detected_language: language,
            image_url: url,
        })
    }
}
