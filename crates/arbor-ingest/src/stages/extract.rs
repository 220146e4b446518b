//! Structured extraction: mines normalized chunk text for typed suggestions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn, Instrument};

use super::error::StageError;
use super::llm::{parse_json_reply, ChatClient, ChatMessage};
use super::suggestion::{ConfidenceBand, RawSuggestion, SuggestedData};
use super::{ensure_current, page_key, resolve_page, superseded, StageContext};
use crate::config::BackendConfig;
use crate::db::catalog_repo;
use crate::db::chunk_repo;
use crate::db::page_repo::{self, AttemptGuard, PageWrite};
use crate::db::suggestion_repo::{self, SuggestionRow};
use crate::db::SuggestionStatus;

/// Suggestions below this confidence are never persisted, whatever the config says.
pub const CONFIDENCE_FLOOR: f64 = 0.5;

#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    fn check_config(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn extract(&self, content: &str) -> Result<Vec<RawSuggestion>, StageError>;
}

const EXTRACTION_PROMPT: &str = "You extract facts from arboriculture and tree-inspection text \
for a knowledge base. Only report what the text explicitly states; never guess. \
Each suggestion has a target_table, a data object, a confidence and a short rationale quoting \
the supporting text. Tables and data fields:\n\
- species: scientific_name, common_name\n\
- defects: name, description, severity\n\
- fungi: scientific_name, host_species, decay_type\n\
- mitigation_measures: measure, applies_to, urgency\n\
- tree_features: feature, value, unit\n\
- kb_notes: text\n\
Confidence: 0.9-1.0 explicit and complete, 0.7-0.89 clear with minor gaps, \
0.5-0.69 partial or interpreted. Omit anything below 0.5. \
Reply with a JSON object: {\"suggestions\": [{\"target_table\": string, \"data\": object, \
\"confidence\": number, \"rationale\": string}]}. An empty list is a valid answer.";

/// Structured extraction through a chat-completions model.
pub struct LlmStructuredExtractor {
    client: ChatClient,
}

impl LlmStructuredExtractor {
    pub fn new(config: &BackendConfig) -> Result<Self, StageError> {
        Ok(Self {
            client: ChatClient::new("extraction", config)?,
        })
    }
}

/// Pulls the suggestion list out of a reply, skipping items that do not
/// have the basic shape.
fn parse_suggestions(value: Value) -> Vec<RawSuggestion> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("suggestions") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawSuggestion>(item) {
            Ok(raw) => Some(raw),
            Err(e) => {
                debug!(error = %e, "skipping malformed suggestion item");
                None
            }
        })
        .collect()
}

#[async_trait]
impl StructuredExtractor for LlmStructuredExtractor {
    fn check_config(&self) -> Result<(), StageError> {
        self.client.api_key().map(|_| ())
    }

    async fn extract(&self, content: &str) -> Result<Vec<RawSuggestion>, StageError> {
        let messages = [ChatMessage::system(EXTRACTION_PROMPT), ChatMessage::user(content)];
        let reply = self.client.complete_json(&messages).await?;
        let value = parse_json_reply(self.client.provider(), &reply)?;
        Ok(parse_suggestions(value))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractRequest {
    pub chunk_id: String,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(skip)]
    pub attempt: AttemptGuard,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractOutcome {
    pub chunk_id: String,
    pub queue_id: String,
    pub page_number: i64,
    pub suggestions: Vec<SuggestionRow>,
    /// Items discarded for low confidence or malformed payloads.
    pub dropped: usize,
}

#[derive(Debug, Default, Serialize)]
struct BandCounts {
    explicit: usize,
    clear: usize,
    partial: usize,
}

pub struct StructuredExtractionStage {
    ctx: StageContext,
    extractor: Arc<dyn StructuredExtractor>,
}

impl StructuredExtractionStage {
    pub fn new(ctx: StageContext, extractor: Arc<dyn StructuredExtractor>) -> Self {
        Self { ctx, extractor }
    }

    pub async fn run(&self, req: &ExtractRequest) -> Result<ExtractOutcome, StageError> {
        let span = tracing::info_span!("extract_structured", chunk_id = %req.chunk_id);
        self.run_inner(req).instrument(span).await
    }

    async fn run_inner(&self, req: &ExtractRequest) -> Result<ExtractOutcome, StageError> {
        if req.chunk_id.trim().is_empty() {
            return Err(StageError::Validation("chunkId is required".into()));
        }
        self.extractor.check_config()?;

        let db = self.ctx.db();
        let chunk = chunk_repo::find_by_id(db, &req.chunk_id)?.ok_or_else(|| StageError::NotFound {
            entity: "chunk",
            id: req.chunk_id.clone(),
        })?;
        let page = resolve_page(db, req.queue_id.as_deref(), &chunk.source_id, chunk.page)?
            .ok_or_else(|| StageError::NotFound {
                entity: "page",
                id: format!("{}/{}", chunk.source_id, chunk.page),
            })?;
        ensure_current(&page, req.attempt)?;
        if page.phase2_completed_at.is_none() {
            return Err(StageError::OutOfOrder {
                stage: "structured extraction",
                missing: "translation",
            });
        }

        let text = chunk
            .content_en
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&chunk.content);
        let raw = self.extractor.extract(text).await?;
        let received = raw.len();

        let floor = self.ctx.config.min_confidence.max(CONFIDENCE_FLOOR);
        let now = crate::db::now();
        let mut bands = BandCounts::default();
        let mut rows = Vec::with_capacity(raw.len());
        for item in &raw {
            let Some(band) = ConfidenceBand::of(item.confidence, floor) else {
                debug!(table = %item.target_table, confidence = item.confidence, "dropping low-confidence suggestion");
                continue;
            };
            let Some(mut data) = SuggestedData::from_raw(item) else {
                warn!(table = %item.target_table, "dropping suggestion with unrecognized payload");
                continue;
            };
            if let Some((table, term)) = data.lookup() {
                let candidates =
                    catalog_repo::find_similar(db, table, term, self.ctx.config.max_candidates)?;
                data.set_matches(candidates);
            }
            match band {
                ConfidenceBand::Explicit => bands.explicit += 1,
                ConfidenceBand::Clear => bands.clear += 1,
                ConfidenceBand::Partial => bands.partial += 1,
            }
            rows.push(SuggestionRow {
                id: uuid::Uuid::new_v4().to_string(),
                queue_id: page.queue_id.clone(),
                page_number: page.page_number,
                chunk_id: Some(chunk.id.clone()),
                suggestion_type: data.suggestion_type(),
                target_table: data.target_table().to_string(),
                suggested_data: data.payload(),
                confidence: item.confidence,
                status: SuggestionStatus::Pending,
                rationale: item.rationale.clone().filter(|r| !r.trim().is_empty()),
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        }
        let dropped = received - rows.len();

        let max_confidence = rows.iter().map(|r| r.confidence).fold(None, |acc: Option<f64>, c| {
            Some(acc.map_or(c, |a| a.max(c)))
        });
        let summary = json!({
            "suggestions": rows.len(),
            "dropped": dropped,
            "bands": bands,
            "maxConfidence": max_confidence,
            "extractedAt": now,
        });
        db.with_tx(|conn| {
            let write = page_repo::stamp_structured_on(conn, &page_key(&page), req.attempt, &now)?;
            if write == PageWrite::Skipped && req.attempt.is_some() {
                return Ok(Err(superseded(&page)));
            }
            suggestion_repo::replace_pending_for_page_on(conn, &page.queue_id, page.page_number, &rows)?;
            chunk_repo::set_extraction_metadata_on(conn, &chunk.id, &summary, &now)?;
            Ok(Ok(()))
        })??;

        info!(
            queue_id = %page.queue_id,
            page = page.page_number,
            accepted = rows.len(),
            dropped,
            "structured extraction finished"
        );

        Ok(ExtractOutcome {
            chunk_id: chunk.id,
            queue_id: page.queue_id,
            page_number: page.page_number,
            suggestions: rows,
            dropped,
        })
    }
}
