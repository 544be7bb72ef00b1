//! The `Analyzer` contract the Analysis Service codes against, and the single
//! place that decides which implementation sits behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analysis::legacy::{LegacyAdapter, SinglePassReviewer};
use crate::analysis::model::{AnalysisRequest, AnalysisResult, RunFailure, RunStatus, StageError};
use crate::analysis::orchestrator::{Orchestrator, PipelineError, ANALYZER_LABEL};
use crate::analysis::scoring::ScoringPolicy;
use crate::analysis::stages::default_pipeline;
use crate::llm_client::LlmProvider;
use crate::prompts::PromptRegistry;

/// Closed set of run-level failures an `Analyzer` may return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    #[error("invalid analysis request: {0}")]
    Validation(String),

    #[error("stage `{stage}` failed: {message}")]
    Provider { stage: String, message: String },

    #[error("stage `{stage}` timed out")]
    Timeout { stage: String },

    #[error("analysis was cancelled")]
    Cancelled,

    #[error("could not translate analyzer output: {0}")]
    Adapter(String),
}

impl AnalyzerError {
    /// Whether a fresh request with the same input has a reasonable chance to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalyzerError::Provider { .. } | AnalyzerError::Timeout { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            AnalyzerError::Validation(_) => "VALIDATION_ERROR",
            AnalyzerError::Provider { .. } => "PROVIDER_ERROR",
            AnalyzerError::Timeout { .. } => "ANALYSIS_TIMEOUT",
            AnalyzerError::Cancelled => "ANALYSIS_CANCELLED",
            AnalyzerError::Adapter(_) => "ADAPTER_ERROR",
        }
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Label recorded in `AnalysisResult::analyzer`.
    fn name(&self) -> &'static str;

    async fn analyze_with_cancel(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalyzerError>;

    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult, AnalyzerError> {
        self.analyze_with_cancel(request, CancellationToken::new())
            .await
    }
}

/// The multi-stage pipeline behind the `Analyzer` contract.
pub struct OrchestratedAnalyzer {
    orchestrator: Orchestrator,
}

impl OrchestratedAnalyzer {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

fn run_failure_error(failure: RunFailure) -> AnalyzerError {
    match failure {
        RunFailure::RequiredStage { stage, error } => match error {
            StageError::Timeout { .. } => AnalyzerError::Timeout { stage },
            StageError::Cancelled => AnalyzerError::Cancelled,
            StageError::Parse { message }
            | StageError::Provider { message }
            | StageError::Prompt { message } => AnalyzerError::Provider { stage, message },
        },
        RunFailure::Cancelled { .. } => AnalyzerError::Cancelled,
        RunFailure::DeadlineExceeded { stage, .. } => AnalyzerError::Timeout {
            stage: stage.unwrap_or_else(|| "run".to_string()),
        },
    }
}

#[async_trait]
impl Analyzer for OrchestratedAnalyzer {
    fn name(&self) -> &'static str {
        ANALYZER_LABEL
    }

    async fn analyze_with_cancel(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, AnalyzerError> {
        request.validate()?;
        let result = self.orchestrator.run(&request, &cancel).await;
        match (result.status, result.failure) {
            (RunStatus::Failed, Some(failure)) => Err(run_failure_error(failure)),
            (RunStatus::Failed, None) => Err(AnalyzerError::Provider {
                stage: "run".to_string(),
                message: "run failed without a recorded reason".to_string(),
            }),
            (_, failure) => Ok(AnalysisResult { failure, ..result }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Selection
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerKind {
    Orchestrated,
    Legacy,
}

impl AnalyzerKind {
    /// `USE_NEW_ANALYZER=true` selects the orchestrated pipeline.
    pub fn from_flag(use_new_analyzer: bool) -> Self {
        if use_new_analyzer {
            AnalyzerKind::Orchestrated
        } else {
            AnalyzerKind::Legacy
        }
    }
}

/// What either implementation may need to be built.
pub struct AnalyzerDeps {
    pub registry: Arc<PromptRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub stage_timeout: Duration,
    pub scoring: ScoringPolicy,
}

/// The only place an implementation is chosen.
pub fn select_analyzer(
    kind: AnalyzerKind,
    deps: AnalyzerDeps,
) -> Result<Arc<dyn Analyzer>, PipelineError> {
    let analyzer: Arc<dyn Analyzer> = match kind {
        AnalyzerKind::Orchestrated => {
            let stages = default_pipeline(Arc::clone(&deps.provider), deps.stage_timeout);
            let orchestrator = Orchestrator::new(deps.registry, stages, deps.scoring)?;
            info!("Pipeline stages: {}", orchestrator.stage_names().join(" → "));
            Arc::new(OrchestratedAnalyzer::new(orchestrator))
        }
        AnalyzerKind::Legacy => Arc::new(LegacyAdapter::new(SinglePassReviewer::new(
            deps.provider,
            deps.stage_timeout,
        ))),
    };
    info!("Analyzer selected: {}", analyzer.name());
    Ok(analyzer)
}
