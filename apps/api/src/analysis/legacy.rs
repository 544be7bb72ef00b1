//! The previous single-pass reviewer and the adapter that lets it stand in
//! for the orchestrated pipeline behind the `Analyzer` contract.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::analyzer::{Analyzer, AnalyzerError};
use crate::analysis::model::{
    AnalysisRequest, AnalysisResult, FeedbackItem, Priority, RunStatus, StageResult,
};
use crate::llm_client::{CompletionRequest, LlmError, LlmProvider};
use crate::prompts::ModelParams;

pub const LEGACY_STAGE: &str = "legacy_review";
pub const ANALYZER_LABEL: &str = "legacy";
const MAX_RATING: f64 = 10.0;

// ────────────────────────────────────────────────────────────────────────────
// Prompts
// ────────────────────────────────────────────────────────────────────────────

pub const REVIEW_SYSTEM: &str = "You are a senior resume consultant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

pub const REVIEW_PROMPT_TEMPLATE: &str = r#"Review the resume below for a candidate targeting the {industry} industry.
{notes}

Return a JSON object with exactly these fields:
{
  "rating": <number from 0 to 10>,
  "strengths": ["..."],
  "improvements": ["..."],
  "section_notes": {"<section name>": "<note>"}
}

Resume:
{resume_text}"#;

// ────────────────────────────────────────────────────────────────────────────
// Legacy shapes
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyReviewInput {
    pub resume_text: String,
    pub target_industry: String,
    /// Free-text reviewer notes; the old engine had no notion of depth or focus areas.
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LegacyReview {
    /// 0–10.
    pub rating: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub section_notes: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum LegacyError {
    #[error("review timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("review output was not valid JSON: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait LegacyReviewEngine: Send + Sync {
    async fn review(&self, input: &LegacyReviewInput) -> Result<LegacyReview, LegacyError>;
}

/// One prompt, one call, one free-form review.
pub struct SinglePassReviewer {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
    params: ModelParams,
}

impl SinglePassReviewer {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            params: ModelParams::default(),
        }
    }
}

fn build_review_prompt(input: &LegacyReviewInput) -> String {
    let notes = input
        .notes
        .as_deref()
        .map(|n| format!("Reviewer notes: {n}"))
        .unwrap_or_default();
    let holes = [
        ("{industry}", input.target_industry.as_str()),
        ("{notes}", notes.as_str()),
        ("{resume_text}", input.resume_text.as_str()),
    ];

    // Single pass over the template: substituted values are never rescanned.
    let mut prompt =
        String::with_capacity(REVIEW_PROMPT_TEMPLATE.len() + input.resume_text.len());
    let mut rest = REVIEW_PROMPT_TEMPLATE;
    while let Some(start) = rest.find('{') {
        prompt.push_str(&rest[..start]);
        let tail = &rest[start..];
        match holes.iter().find(|(hole, _)| tail.starts_with(hole)) {
            Some((hole, value)) => {
                prompt.push_str(value);
                rest = &tail[hole.len()..];
            }
            None => {
                prompt.push('{');
                rest = &tail[1..];
            }
        }
    }
    prompt.push_str(rest);
    prompt
}

#[async_trait]
impl LegacyReviewEngine for SinglePassReviewer {
    async fn review(&self, input: &LegacyReviewInput) -> Result<LegacyReview, LegacyError> {
        let prompt = build_review_prompt(input);
        let request = CompletionRequest {
            system: REVIEW_SYSTEM,
            prompt: &prompt,
            params: &self.params,
            timeout: self.timeout,
        };
        let completion = tokio::time::timeout(self.timeout, self.provider.complete(request))
            .await
            .map_err(|_| LegacyError::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            })??;
        serde_json::from_str(completion.json_body())
            .map_err(|e| LegacyError::Malformed(e.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Adapter
// ────────────────────────────────────────────────────────────────────────────

/// Presents any `LegacyReviewEngine` as an `Analyzer`. Translation only:
/// request → legacy input, legacy review → `AnalysisResult`.
pub struct LegacyAdapter<E> {
    engine: E,
}

impl<E: LegacyReviewEngine> LegacyAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }
}

pub fn to_legacy_input(request: &AnalysisRequest) -> LegacyReviewInput {
    let notes = (!request.focus_areas.is_empty())
        .then(|| format!("focus on {}", request.focus_areas.join(", ")));
    LegacyReviewInput {
        resume_text: request.resume_text.trim().to_string(),
        target_industry: request.industry.trim().to_string(),
        notes,
    }
}

/// Maps a legacy review onto a single `legacy_review` stage. Rating 0–10
/// becomes an `overall` score of 0–100.
pub fn from_legacy_review(review: LegacyReview) -> Result<StageResult, AnalyzerError> {
    if !review.rating.is_finite() || !(0.0..=MAX_RATING).contains(&review.rating) {
        return Err(AnalyzerError::Adapter(format!(
            "legacy rating {} is outside 0–10",
            review.rating
        )));
    }
    if review.section_notes.keys().any(|k| k.trim().is_empty()) {
        return Err(AnalyzerError::Adapter(
            "legacy review has a section note with an empty section name".to_string(),
        ));
    }
    if review
        .strengths
        .iter()
        .chain(review.improvements.iter())
        .any(|s| s.trim().is_empty())
    {
        return Err(AnalyzerError::Adapter(
            "legacy review has a blank strength or improvement".to_string(),
        ));
    }

    let feedback = review
        .strengths
        .into_iter()
        .map(|message| FeedbackItem {
            area: "strengths".to_string(),
            message,
            priority: Priority::Low,
        })
        .chain(review.improvements.into_iter().map(|message| FeedbackItem {
            area: "improvements".to_string(),
            message,
            priority: Priority::High,
        }))
        .chain(review.section_notes.into_iter().map(|(area, message)| FeedbackItem {
            area,
            message,
            priority: Priority::Medium,
        }))
        .collect();

    let scores = BTreeMap::from([("overall".to_string(), review.rating * 10.0)]);
    Ok(StageResult::ok(LEGACY_STAGE, scores, feedback))
}

fn engine_error(error: LegacyError) -> AnalyzerError {
    match error {
        LegacyError::Timeout { .. } => AnalyzerError::Timeout {
            stage: LEGACY_STAGE.to_string(),
        },
        other => AnalyzerError::Provider {
            stage: LEGACY_STAGE.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl<E: LegacyReviewEngine> Analyzer for LegacyAdapter<E> {
    fn name(&self) -> &'static str {
        ANALYZER_LABEL
    }

    async fn analyze_with_cancel(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalyzerError> {
        request.validate()?;
        let started_at = Utc::now();
        let started = Instant::now();
        let input = to_legacy_input(&request);

        let review = self.engine.review(&input);
        let outcome = match request.deadline_ms {
            Some(ms) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AnalyzerError::Cancelled),
                res = tokio::time::timeout(Duration::from_millis(ms), review) => {
                    res.map_err(|_| AnalyzerError::Timeout { stage: LEGACY_STAGE.to_string() })?
                }
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AnalyzerError::Cancelled),
                res = review => res,
            },
        };

        let review = outcome.map_err(|e| {
            warn!(request_id = %request.request_id, "Legacy review failed: {e}");
            engine_error(e)
        })?;
        let stage = from_legacy_review(review)?.with_duration_ms(started.elapsed().as_millis() as u64);
        let overall_score = stage.stage_score();

        info!(
            request_id = %request.request_id,
            overall_score = ?overall_score,
            "Legacy review translated"
        );

        Ok(AnalysisResult {
            request_id: request.request_id,
            resume_id: request.resume_id,
            analyzer: ANALYZER_LABEL.to_string(),
            status: RunStatus::Completed,
            stages: vec![stage],
            overall_score,
            failure: None,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
