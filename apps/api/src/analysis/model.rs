//! Request, per-stage result, and aggregated result types shared by every
//! `Analyzer` implementation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::analysis::analyzer::AnalyzerError;

pub const MAX_RESUME_CHARS: usize = 60_000;
const MAX_INDUSTRY_CHARS: usize = 64;
const MAX_FOCUS_AREAS: usize = 10;
pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

/// How much analysis to run. Stages declare the minimum depth they need.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl AnalysisDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisDepth::Quick => "quick",
            AnalysisDepth::Standard => "standard",
            AnalysisDepth::Deep => "deep",
        }
    }
}

/// One resume analysis request. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub request_id: Uuid,
    pub resume_id: Uuid,
    pub resume_text: String,
    pub industry: String,
    /// Stable key for prompt rollout bucketing, e.g. the consultant id.
    pub requester_key: String,
    #[serde(default)]
    pub depth: AnalysisDepth,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    /// Whole-run deadline; observed between stages and inside provider calls.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl AnalysisRequest {
    pub fn new(
        resume_id: Uuid,
        resume_text: impl Into<String>,
        industry: impl Into<String>,
        requester_key: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            resume_id,
            resume_text: resume_text.into(),
            industry: industry.into(),
            requester_key: requester_key.into(),
            depth: AnalysisDepth::default(),
            focus_areas: Vec::new(),
            deadline_ms: None,
        }
    }

    pub fn with_depth(mut self, depth: AnalysisDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_focus_areas(mut self, focus_areas: Vec<String>) -> Self {
        self.focus_areas = focus_areas;
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Rejects malformed requests before any stage runs.
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        let text = self.resume_text.trim();
        if text.is_empty() {
            return Err(AnalyzerError::Validation(
                "resume_text cannot be empty".to_string(),
            ));
        }
        if text.chars().count() > MAX_RESUME_CHARS {
            return Err(AnalyzerError::Validation(format!(
                "resume_text exceeds {MAX_RESUME_CHARS} characters"
            )));
        }

        let industry = self.industry.trim();
        if industry.is_empty() {
            return Err(AnalyzerError::Validation(
                "industry cannot be empty".to_string(),
            ));
        }
        if industry.chars().count() > MAX_INDUSTRY_CHARS {
            return Err(AnalyzerError::Validation(format!(
                "industry exceeds {MAX_INDUSTRY_CHARS} characters"
            )));
        }
        if !industry
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '&' | '/'))
        {
            return Err(AnalyzerError::Validation(format!(
                "industry `{industry}` contains unsupported characters"
            )));
        }

        if self.requester_key.trim().is_empty() {
            return Err(AnalyzerError::Validation(
                "requester_key cannot be empty".to_string(),
            ));
        }
        if self.focus_areas.len() > MAX_FOCUS_AREAS {
            return Err(AnalyzerError::Validation(format!(
                "at most {MAX_FOCUS_AREAS} focus areas are allowed"
            )));
        }
        if self.focus_areas.iter().any(|f| f.trim().is_empty()) {
            return Err(AnalyzerError::Validation(
                "focus areas cannot be blank".to_string(),
            ));
        }
        if self.deadline_ms == Some(0) {
            return Err(AnalyzerError::Validation(
                "deadline_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
    Skipped,
}

/// Why a stage failed. Stage failures are recorded, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("could not parse model output: {message}")]
    Parse { message: String },

    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("prompt error: {message}")]
    Prompt { message: String },

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub area: String,
    pub message: String,
    #[serde(default)]
    pub priority: Priority,
}

/// The prompt version a stage actually ran with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    /// Named scores, each within 0–100.
    pub scores: BTreeMap<String, f64>,
    pub feedback: Vec<FeedbackItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn ok(
        stage: impl Into<String>,
        scores: BTreeMap<String, f64>,
        feedback: Vec<FeedbackItem>,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Ok,
            scores,
            feedback,
            prompt: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(stage: impl Into<String>, error: StageError) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Failed,
            scores: BTreeMap::new(),
            feedback: Vec::new(),
            prompt: None,
            error: Some(error),
            duration_ms: 0,
        }
    }

    pub fn skipped(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            scores: BTreeMap::new(),
            feedback: Vec::new(),
            prompt: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn with_prompt(mut self, prompt: Option<PromptRef>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == StageStatus::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Mean of this stage's named scores; `None` unless the stage succeeded with scores.
    pub fn stage_score(&self) -> Option<f64> {
        if !self.is_ok() || self.scores.is_empty() {
            return None;
        }
        Some(self.scores.values().sum::<f64>() / self.scores.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    RequiredStage { stage: String, error: StageError },
    /// `stage` is the stage that was about to start or was in flight.
    Cancelled { stage: Option<String> },
    /// The request's own `deadline_ms` ran out.
    DeadlineExceeded {
        stage: Option<String>,
        deadline_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_id: Uuid,
    pub resume_id: Uuid,
    /// Which `Analyzer` produced this result.
    pub analyzer: String,
    pub status: RunStatus,
    pub stages: Vec<StageResult>,
    pub overall_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }
}
