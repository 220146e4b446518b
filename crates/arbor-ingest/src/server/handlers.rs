use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ApiError;
use super::AppState;
use crate::auth::{AuthContext, ADMIN_ROLE};
use crate::queue::QueueError;
use crate::reconciler::OrphanRecord;
use crate::stages::{ExtractRequest, OcrRequest, TranslateRequest};

type ApiResult = Result<Response, ApiError>;

#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Success {
        success: true,
        data,
    })
    .into_response()
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("invalid request body: {e}")))
}

/// Like [`parse_body`], but an empty body yields the default value.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

fn require_role(auth: &AuthContext, role: &str) -> Result<(), ApiError> {
    if auth.has_role(role) {
        Ok(())
    } else {
        tracing::warn!(user = ?auth.current_user, role, "request rejected: missing role");
        Err(ApiError::forbidden(role))
    }
}

pub(super) async fn healthz() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

// Stage functions

pub(super) async fn ocr_extract(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let req: OcrRequest = parse_body(&body)?;
    Ok(ok(state.pipeline.ocr().run(&req).await?))
}

pub(super) async fn translate_chunk(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let req: TranslateRequest = parse_body(&body)?;
    Ok(ok(state.pipeline.translation().run(&req).await?))
}

pub(super) async fn extract_structured(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let req: ExtractRequest = parse_body(&body)?;
    Ok(ok(state.pipeline.extraction().run(&req).await?))
}

// Queue

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBatchBody {
    source_id: String,
    #[serde(default)]
    name: String,
    page_count: i64,
}

pub(super) async fn create_batch(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let req: CreateBatchBody = parse_body(&body)?;
    let detail = state
        .coordinator()
        .create_batch(&req.source_id, &req.name, req.page_count)?;
    Ok(ok(detail))
}

pub(super) async fn get_batch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(state.coordinator().batch_detail(&id)?))
}

pub(super) async fn batch_stats(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let stats = state.coordinator().batch_stats(&id)?;
    Ok(ok(json!({ "stats": stats })))
}

pub(super) async fn global_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.coordinator().global_stats()?;
    Ok(ok(json!({ "stats": stats })))
}

pub(super) async fn retry_page(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(state.coordinator().retry_page(&id)?))
}

pub(super) async fn pause_page(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(state.coordinator().pause_page(&id)?))
}

pub(super) async fn resume_page(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(state.coordinator().resume_page(&id)?))
}

pub(super) async fn reprocess_page(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(ok(state.coordinator().reprocess_page(&id)?))
}

pub(super) async fn retry_errors(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let requeued = state.coordinator().retry_all_errors(&id)?;
    Ok(ok(json!({ "requeued": requeued })))
}

pub(super) async fn force_restart(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let requeued = state.coordinator().force_restart(&id)?;
    Ok(ok(json!({ "requeued": requeued })))
}

#[derive(Deserialize, Default)]
struct RestartBody {
    #[serde(default)]
    confirm: bool,
}

pub(super) async fn restart_batch(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    require_role(&auth, ADMIN_ROLE)?;
    let req: RestartBody = parse_optional_body(&body)?;
    if !req.confirm {
        return Err(QueueError::ConfirmationRequired.into());
    }
    tracing::info!(batch_id = %id, user = ?auth.current_user, "restarting entire batch");
    Ok(ok(state.coordinator().restart_entire_batch(&id, req.confirm)?))
}

pub(super) async fn process_next(State(state): State<AppState>) -> ApiResult {
    let processed = state.pipeline.process_next().await?;
    Ok(ok(json!({ "processed": processed })))
}

// Maintenance

pub(super) async fn list_orphans(State(state): State<AppState>) -> ApiResult {
    let orphans = state.reconciler.find_orphans()?;
    Ok(ok(json!({ "orphans": orphans })))
}

#[derive(Deserialize, Default)]
struct CleanupBody {
    #[serde(default)]
    records: Option<Vec<OrphanRecord>>,
}

pub(super) async fn cleanup_orphans(
    State(state): State<AppState>,
    auth: AuthContext,
    body: Bytes,
) -> ApiResult {
    require_role(&auth, ADMIN_ROLE)?;
    let req: CleanupBody = parse_optional_body(&body)?;
    let report = state.reconciler.cleanup(req.records.as_deref()).await?;
    Ok(ok(report))
}
