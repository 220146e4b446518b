//! Translation: normalizes a chunk's text into the target language.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, Instrument};

use super::error::StageError;
use super::language::normalize_language;
use super::llm::{parse_json_reply, ChatClient, ChatMessage};
use super::{ensure_current, page_key, resolve_page, superseded, StageContext};
use crate::config::BackendConfig;
use crate::db::chunk_repo;
use crate::db::page_repo::{self, AttemptGuard, PageWrite};

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub translated_content: String,
    pub detected_language: String,
    pub confidence: f64,
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn check_config(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn translate(
        &self,
        content: &str,
        detected_language: Option<&str>,
        target_language: &str,
    ) -> Result<Translation, StageError>;
}

/// Translation through a chat-completions model.
pub struct LlmTranslator {
    client: ChatClient,
}

impl LlmTranslator {
    pub fn new(config: &BackendConfig) -> Result<Self, StageError> {
        Ok(Self {
            client: ChatClient::new("translation", config)?,
        })
    }
}

fn translation_prompt(target_language: &str, hint: Option<&str>) -> String {
    let hint = hint
        .map(|h| format!(" The text was detected as '{h}', which may be wrong."))
        .unwrap_or_default();
    format!(
        "You translate arboriculture and tree-inspection text into '{target_language}'.{hint} \
Keep scientific binomial names (e.g. Quercus robur), units, numbers and measurements exactly \
as written. Keep technical vocabulary precise. If the text is already in '{target_language}', \
return it unchanged. Reply with a JSON object: {{\"translatedContent\": string, \
\"detectedLanguage\": ISO 639-1 code of the original, \"confidence\": number between 0 and 1}}."
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslationReply {
    translated_content: String,
    #[serde(default)]
    detected_language: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[async_trait]
impl Translator for LlmTranslator {
    fn check_config(&self) -> Result<(), StageError> {
        self.client.api_key().map(|_| ())
    }

    async fn translate(
        &self,
        content: &str,
        detected_language: Option<&str>,
        target_language: &str,
    ) -> Result<Translation, StageError> {
        let messages = [
            ChatMessage::system(&translation_prompt(target_language, detected_language)),
            ChatMessage::user(content),
        ];
        let reply = self.client.complete_json(&messages).await?;
        let value = parse_json_reply(self.client.provider(), &reply)?;
        let parsed: TranslationReply = serde_json::from_value(value).map_err(|e| {
            StageError::backend(self.client.provider(), format!("unexpected reply shape: {e}"))
        })?;
        Ok(Translation {
            translated_content: parsed.translated_content,
            detected_language: parsed
                .detected_language
                .as_deref()
                .and_then(normalize_language)
                .or_else(|| detected_language.map(str::to_string))
                .unwrap_or_else(|| "und".to_string()),
            confidence: parsed
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(0.8),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequest {
    pub chunk_id: String,
    /// Overrides the stored chunk content when present.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub detected_language: Option<String>,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(skip)]
    pub attempt: AttemptGuard,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateOutcome {
    pub chunk_id: String,
    pub translated_content: String,
    pub detected_language: String,
    pub confidence: f64,
    /// True when the content was too short to send to the backend.
    pub skipped: bool,
}

pub struct TranslationStage {
    ctx: StageContext,
    translator: Arc<dyn Translator>,
}

impl TranslationStage {
    pub fn new(ctx: StageContext, translator: Arc<dyn Translator>) -> Self {
        Self { ctx, translator }
    }

    pub async fn run(&self, req: &TranslateRequest) -> Result<TranslateOutcome, StageError> {
        let span = tracing::info_span!("translate", chunk_id = %req.chunk_id);
        self.run_inner(req).instrument(span).await
    }

    async fn run_inner(&self, req: &TranslateRequest) -> Result<TranslateOutcome, StageError> {
        if req.chunk_id.trim().is_empty() {
            return Err(StageError::Validation("chunkId is required".into()));
        }
        self.translator.check_config()?;

        let db = self.ctx.db();
        let target = self.ctx.config.target_language.as_str();
        let chunk = chunk_repo::find_by_id(db, &req.chunk_id)?.ok_or_else(|| StageError::NotFound {
            entity: "chunk",
            id: req.chunk_id.clone(),
        })?;

        let page = resolve_page(db, req.queue_id.as_deref(), &chunk.source_id, chunk.page)?;
        if let Some(page) = &page {
            ensure_current(page, req.attempt)?;
            if page.phase1_completed_at.is_none() {
                return Err(StageError::OutOfOrder {
                    stage: "translation",
                    missing: "text extraction",
                });
            }
        }

        let content = req
            .content
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&chunk.content);

        let skipped = content.trim().chars().count() < self.ctx.config.min_translation_chars;
        let translation = if skipped {
            debug!(length = content.trim().chars().count(), "content below threshold, passing through");
            Translation {
                translated_content: content.to_string(),
                detected_language: target.to_string(),
                confidence: 1.0,
            }
        } else {
            let hint = req
                .detected_language
                .as_deref()
                .or(chunk.source_language.as_deref());
            self.translator.translate(content, hint, target).await?
        };

        let now = crate::db::now();
        let details = json!({
            "confidence": translation.confidence,
            "skipped": skipped,
            "targetLanguage": target,
            "translatedAt": now,
        });
        let write = db.with_tx(|conn| {
            let write = match &page {
                Some(page) => {
                    let write = page_repo::stamp_translated_on(conn, &page_key(page), req.attempt, &now)?;
                    if write == PageWrite::Skipped && req.attempt.is_some() {
                        return Ok(Err(superseded(page)));
                    }
                    Some(write)
                }
                None => None,
            };
            chunk_repo::set_translation_on(
                conn,
                &chunk.id,
                &translation.translated_content,
                &translation.detected_language,
                &details,
                &now,
            )?;
            Ok(Ok(write))
        })??;
        if let (Some(page), Some(write)) = (&page, write) {
            self.ctx.page_written(page, write);
        }

        info!(
            detected_language = %translation.detected_language,
            confidence = translation.confidence,
            skipped,
            "chunk translated"
        );

        Ok(TranslateOutcome {
            chunk_id: chunk.id,
            translated_content: translation.translated_content,
            detected_language: translation.detected_language,
            confidence: translation.confidence,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_mentions_target_and_hint() {
        let prompt = translation_prompt("en", Some("de"));
        assert!(prompt.contains("into 'en'"));
        assert!(prompt.contains("detected as 'de'"));
        assert!(!translation_prompt("en", None).contains("detected as"));
    }
}
