use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::analysis::{AnalysisDepth, AnalysisRequest, AnalysisResult};
use crate::db;
use crate::errors::AppError;
use crate::models::analysis::AnalysisRow;
use crate::service::catalog_summary::{summarize, CatalogSummary};
use crate::service::resume_text::fetch_resume_text;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAnalysisRequest {
    pub resume_id: Uuid,
    pub requester_key: String,
    pub industry: String,
    #[serde(default)]
    pub depth: Option<AnalysisDepth>,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

pub fn build_analysis_request(body: CreateAnalysisRequest, resume_text: String) -> AnalysisRequest {
    let mut request = AnalysisRequest::new(
        body.resume_id,
        resume_text,
        body.industry,
        body.requester_key,
    )
    .with_depth(body.depth.unwrap_or_default())
    .with_focus_areas(body.focus_areas);
    request.deadline_ms = body.deadline_ms;
    request
}

/// POST /api/v1/analyses
///
/// Downloads the resume, runs the configured analyzer, persists the result.
/// Run-level failures come back as typed errors and are not persisted.
pub async fn handle_create_analysis(
    State(state): State<AppState>,
    Json(body): Json<CreateAnalysisRequest>,
) -> Result<(StatusCode, Json<AnalysisResult>), AppError> {
    if body.requester_key.trim().is_empty() {
        return Err(AppError::Validation("requester_key cannot be empty".to_string()));
    }

    let file = db::get_resume_file(&state.db, body.resume_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resume {} not found", body.resume_id)))?;
    let resume_text = fetch_resume_text(&state.s3, &state.config.s3_bucket, &file).await?;

    let requester_key = body.requester_key.clone();
    let request = build_analysis_request(body, resume_text);
    info!(
        request_id = %request.request_id,
        resume_id = %request.resume_id,
        analyzer = state.analyzer.name(),
        "Analysis requested"
    );

    let result = state.analyzer.analyze(request).await?;
    db::save_analysis(&state.db, &requester_key, &result).await?;

    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /api/v1/analyses/:id
pub async fn handle_get_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AnalysisRow>, AppError> {
    let row = db::get_analysis(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Analysis {id} not found")))?;
    Ok(Json(row))
}

/// GET /api/v1/admin/prompts
pub async fn handle_list_prompts(State(state): State<AppState>) -> Json<CatalogSummary> {
    Json(summarize(&state.registry.snapshot()))
}

/// POST /api/v1/admin/prompts/reload
///
/// Re-reads prompt and rollout files. A rejected reload leaves the running
/// configuration untouched and reports the offending file and field.
pub async fn handle_reload_prompts(
    State(state): State<AppState>,
) -> Result<Json<CatalogSummary>, AppError> {
    let registry = Arc::clone(&state.registry);
    let catalog = tokio::task::spawn_blocking(move || registry.reload())
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("reload task failed: {e}")))??;
    Ok(Json(summarize(&catalog)))
}
