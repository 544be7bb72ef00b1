//! Orchestrator — sequences stage agents into one analysis run.
//!
//! `pending → running(stage i) → aggregating → completed | partial | failed`
//!
//! Stages run strictly in configured order. A failed required stage ends the
//! run on the spot; a failed optional stage is recorded and the run moves on.
//! Cancellation (caller token or request deadline) is checked before every
//! stage and is visible to the stage while its provider call is in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::analysis::agent::{StageAgent, StageContext};
use crate::analysis::model::{
    AnalysisDepth, AnalysisRequest, AnalysisResult, RunFailure, RunStatus, StageError,
    StageResult, StageStatus,
};
use crate::analysis::scoring::ScoringPolicy;
use crate::prompts::PromptRegistry;

/// `AnalysisResult::analyzer` for runs produced here.
pub const ANALYZER_LABEL: &str = "orchestrator";

/// One pipeline slot.
#[derive(Clone)]
pub struct StageSpec {
    agent: Arc<dyn StageAgent>,
    required: bool,
    min_depth: AnalysisDepth,
}

impl StageSpec {
    pub fn required(agent: Arc<dyn StageAgent>) -> Self {
        Self {
            agent,
            required: true,
            min_depth: AnalysisDepth::Quick,
        }
    }

    pub fn optional(agent: Arc<dyn StageAgent>) -> Self {
        Self {
            agent,
            required: false,
            min_depth: AnalysisDepth::Quick,
        }
    }

    /// Requests shallower than `depth` record this stage as skipped.
    pub fn with_min_depth(mut self, depth: AnalysisDepth) -> Self {
        self.min_depth = depth;
        self
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("stage `{0}` appears more than once")]
    DuplicateStage(String),

    #[error("required stage `{stage}` cannot be gated on depth `{depth}`")]
    GatedRequiredStage { stage: String, depth: &'static str },

    #[error("scoring policy weights unknown stage `{0}`")]
    UnknownWeightedStage(String),
}

#[derive(Debug, Clone, Copy)]
enum Phase<'a> {
    Running { index: usize, stage: &'a str },
    Aggregating,
}

impl Phase<'_> {
    fn enter(self) {
        match self {
            Phase::Running { index, stage } => debug!(phase = "running", index, stage, "Run phase"),
            Phase::Aggregating => debug!(phase = "aggregating", "Run phase"),
        }
    }
}

/// Cancels the run token when the request deadline passes. Disarmed on drop.
struct DeadlineTimer(JoinHandle<()>);

impl DeadlineTimer {
    fn arm(token: CancellationToken, after: Duration) -> Self {
        DeadlineTimer(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        }))
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Orchestrator {
    registry: Arc<PromptRegistry>,
    stages: Vec<StageSpec>,
    scoring: ScoringPolicy,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PromptRegistry>,
        stages: Vec<StageSpec>,
        scoring: ScoringPolicy,
    ) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        let mut seen = HashSet::new();
        for spec in &stages {
            if !seen.insert(spec.name().to_string()) {
                return Err(PipelineError::DuplicateStage(spec.name().to_string()));
            }
            if spec.required && spec.min_depth > AnalysisDepth::Quick {
                return Err(PipelineError::GatedRequiredStage {
                    stage: spec.name().to_string(),
                    depth: spec.min_depth.as_str(),
                });
            }
        }
        let names: Vec<&str> = stages.iter().map(StageSpec::name).collect();
        if let Some(unknown) = scoring.unknown_stages(&names).next() {
            return Err(PipelineError::UnknownWeightedStage(unknown.to_string()));
        }
        Ok(Self {
            registry,
            stages,
            scoring,
        })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(StageSpec::name).collect()
    }

    /// Runs every stage for `request` and returns the terminal result.
    /// Never errors: run-level failures are carried in `result.failure`.
    pub async fn run(&self, request: &AnalysisRequest, cancel: &CancellationToken) -> AnalysisResult {
        let span = info_span!(
            "analysis_run",
            request_id = %request.request_id,
            resume_id = %request.resume_id,
            depth = request.depth.as_str()
        );
        self.run_stages(request, cancel).instrument(span).await
    }

    async fn run_stages(&self, request: &AnalysisRequest, cancel: &CancellationToken) -> AnalysisResult {
        let started_at = Utc::now();
        // One snapshot per run: a reload mid-run does not change the prompts this run sees.
        let catalog = self.registry.snapshot();

        let run_token = cancel.child_token();
        let _deadline = request
            .deadline_ms
            .map(|ms| DeadlineTimer::arm(run_token.clone(), Duration::from_millis(ms)));

        info!(stages = self.stages.len(), "Analysis run started");

        let mut results: Vec<StageResult> = Vec::with_capacity(self.stages.len());
        let mut failure: Option<RunFailure> = None;

        for (index, spec) in self.stages.iter().enumerate() {
            let stage = spec.name();

            if spec.min_depth > request.depth {
                debug!(stage, min_depth = spec.min_depth.as_str(), "Stage skipped for depth");
                results.push(StageResult::skipped(stage));
                continue;
            }

            if run_token.is_cancelled() {
                failure = Some(interruption(cancel, request, Some(stage)));
                break;
            }

            Phase::Running { index, stage }.enter();
            let result = {
                let ctx = StageContext {
                    catalog: &catalog,
                    request,
                    prior: &results,
                    cancel: &run_token,
                };
                spec.agent.run(&request.resume_text, &ctx).await
            };

            let stage_error = result.is_failed().then(|| {
                result.error.clone().unwrap_or_else(|| StageError::Provider {
                    message: "stage failed without a reason".to_string(),
                })
            });
            results.push(result);

            match stage_error {
                None => {}
                Some(StageError::Cancelled) => {
                    failure = Some(interruption(cancel, request, Some(stage)));
                    break;
                }
                Some(error) if spec.is_required() => {
                    warn!(stage, "Required stage failed, stopping run: {error}");
                    failure = Some(RunFailure::RequiredStage {
                        stage: stage.to_string(),
                        error,
                    });
                    break;
                }
                Some(error) => {
                    warn!(stage, "Optional stage failed, continuing: {error}");
                }
            }
        }

        let (status, overall_score) = match failure {
            Some(_) => (RunStatus::Failed, None),
            None => {
                Phase::Aggregating.enter();
                let status = if results.iter().any(StageResult::is_failed) {
                    RunStatus::Partial
                } else {
                    RunStatus::Completed
                };
                (status, self.scoring.overall(&results))
            }
        };

        info!(
            status = status.as_str(),
            overall_score = ?overall_score,
            stages_run = results.iter().filter(|r| r.status != StageStatus::Skipped).count(),
            "Analysis run finished"
        );

        AnalysisResult {
            request_id: request.request_id,
            resume_id: request.resume_id,
            analyzer: ANALYZER_LABEL.to_string(),
            status,
            stages: results,
            overall_score,
            failure,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// The caller's token wins over the deadline when both fired.
fn interruption(caller: &CancellationToken, request: &AnalysisRequest, stage: Option<&str>) -> RunFailure {
    let stage = stage.map(str::to_string);
    match request.deadline_ms {
        Some(deadline_ms) if !caller.is_cancelled() => {
            warn!(?stage, deadline_ms, "Analysis run exceeded its deadline");
            RunFailure::DeadlineExceeded { stage, deadline_ms }
        }
        _ => {
            warn!(?stage, "Analysis run cancelled");
            RunFailure::Cancelled { stage }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::agent::LlmStageAgent;
    use crate::analysis::testing::{catalog_with, FakeAgent, ScriptedProvider};
    use crate::prompts::PromptCatalog;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn registry(catalog: PromptCatalog) -> Arc<PromptRegistry> {
        Arc::new(PromptRegistry::with_catalog("unused", &[], &[], catalog).unwrap())
    }

    fn empty_registry() -> Arc<PromptRegistry> {
        registry(catalog_with(&[]))
    }

    fn scored(score: f64) -> StageResult {
        StageResult::ok("", BTreeMap::from([("overall".to_string(), score)]), vec![])
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(
            Uuid::new_v4(),
            "Jane Doe, Senior Analyst, CFA Level III",
            "finance",
            "consultant-1",
        )
    }

    fn orchestrator(stages: Vec<StageSpec>) -> Orchestrator {
        Orchestrator::new(empty_registry(), stages, ScoringPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_finance_two_required_stages_average_to_85() {
        let catalog = catalog_with(&[
            ("structure_analysis", "v1", "STRUCTURE {{industry}}\n{{resume_text}}"),
            ("industry_appeal_analysis", "v1", "APPEAL {{industry}}\n{{prior_findings}}\n{{resume_text}}"),
        ]);
        let provider = Arc::new(
            ScriptedProvider::new()
                .respond("STRUCTURE", r#"{"scores": {"overall": 80}}"#)
                .respond("APPEAL", r#"{"scores": {"overall": 90}}"#),
        );
        let timeout = Duration::from_secs(5);
        let stages = vec![
            StageSpec::required(Arc::new(LlmStageAgent::new(
                "structure",
                "structure_analysis",
                provider.clone(),
                timeout,
            ))),
            StageSpec::required(Arc::new(LlmStageAgent::new(
                "industry_appeal",
                "industry_appeal_analysis",
                provider.clone(),
                timeout,
            ))),
        ];
        let orch = Orchestrator::new(registry(catalog), stages, ScoringPolicy::default()).unwrap();

        let result = orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.overall_score, Some(85.0));
        assert!(result.failure.is_none());
        assert_eq!(provider.calls(), 2);
        // The appeal prompt saw the structure findings.
        assert!(provider.prompts()[1].contains("[structure] scores: overall=80"));
    }

    #[tokio::test]
    async fn test_required_failure_stops_later_stages() {
        let first = FakeAgent::new("structure", scored(70.0));
        let failing = FakeAgent::new(
            "industry_appeal",
            StageResult::failed("", StageError::Provider { message: "boom".into() }),
        );
        let later = FakeAgent::new("achievement_impact", scored(60.0));
        let orch = orchestrator(vec![
            StageSpec::required(first.clone()),
            StageSpec::required(failing.clone()),
            StageSpec::optional(later.clone()),
        ]);

        let result = orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(later.calls(), 0);
        assert_eq!(result.stages.len(), 2);
        assert_eq!(result.overall_score, None);
        assert!(matches!(
            result.failure,
            Some(RunFailure::RequiredStage { ref stage, .. }) if stage == "industry_appeal"
        ));
    }

    #[tokio::test]
    async fn test_required_failure_without_error_still_stops_run() {
        let silent = FakeAgent::new(
            "structure",
            StageResult {
                error: None,
                ..StageResult::failed("", StageError::Cancelled)
            },
        );
        let later = FakeAgent::new("industry_appeal", scored(90.0));
        let orch = orchestrator(vec![
            StageSpec::required(silent.clone()),
            StageSpec::required(later.clone()),
        ]);

        let result = orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(later.calls(), 0);
        assert!(matches!(
            result.failure,
            Some(RunFailure::RequiredStage {
                ref stage,
                error: StageError::Provider { .. },
            }) if stage == "structure"
        ));
    }

    #[tokio::test]
    async fn test_optional_failure_gives_partial_and_later_required_runs() {
        let structure = FakeAgent::new("structure", scored(80.0));
        let impact = FakeAgent::new(
            "achievement_impact",
            StageResult::failed("", StageError::Parse { message: "bad json".into() }),
        );
        let appeal = FakeAgent::new("industry_appeal", scored(90.0));
        let orch = orchestrator(vec![
            StageSpec::required(structure.clone()),
            StageSpec::optional(impact.clone()),
            StageSpec::required(appeal.clone()),
        ]);

        let result = orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(appeal.calls(), 1);
        assert_eq!(result.overall_score, Some(85.0));
        assert!(result.failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_stage_timeout_keeps_first_stage_intact() {
        let catalog = catalog_with(&[("impact_analysis", "v1", "IMPACT {{resume_text}}")]);
        let provider = Arc::new(
            ScriptedProvider::new()
                .respond("IMPACT", r#"{"scores": {"overall": 50}}"#)
                .with_delay(Duration::from_secs(120)),
        );
        let structure = FakeAgent::new("structure", scored(80.0));
        let stages = vec![
            StageSpec::required(structure.clone()),
            StageSpec::optional(Arc::new(LlmStageAgent::new(
                "achievement_impact",
                "impact_analysis",
                provider,
                Duration::from_secs(3),
            ))),
        ];
        let orch = Orchestrator::new(registry(catalog), stages, ScoringPolicy::default()).unwrap();

        let result = orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Partial);
        let impact = result.stage("achievement_impact").unwrap();
        assert_eq!(impact.status, StageStatus::Failed);
        assert_eq!(impact.error, Some(StageError::Timeout { after_ms: 3000 }));
        let first = result.stage("structure").unwrap();
        assert_eq!(first.status, StageStatus::Ok);
        assert_eq!(first.scores["overall"], 80.0);
        assert_eq!(result.overall_score, Some(80.0));
    }

    #[tokio::test]
    async fn test_skipped_stage_excluded_from_score() {
        let structure = FakeAgent::new("structure", scored(80.0));
        let appeal = FakeAgent::new("industry_appeal", scored(90.0));
        let ats = FakeAgent::new("ats_compatibility", scored(10.0));
        let orch = orchestrator(vec![
            StageSpec::required(structure.clone()),
            StageSpec::required(appeal.clone()),
            StageSpec::optional(ats.clone()).with_min_depth(AnalysisDepth::Deep),
        ]);

        let result = orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(ats.calls(), 0);
        assert_eq!(result.stage("ats_compatibility").unwrap().status, StageStatus::Skipped);
        assert_eq!(result.overall_score, Some(85.0));
    }

    #[tokio::test]
    async fn test_prior_results_threaded_in_order() {
        let a = FakeAgent::new("structure", scored(80.0));
        let b = FakeAgent::new("industry_appeal", scored(90.0));
        let c = FakeAgent::new("achievement_impact", scored(70.0));
        let orch = orchestrator(vec![
            StageSpec::required(a.clone()),
            StageSpec::required(b.clone()),
            StageSpec::optional(c.clone()),
        ]);

        orch.run(&request(), &CancellationToken::new()).await;
        assert_eq!(a.seen_prior(), vec![Vec::<String>::new()]);
        assert_eq!(b.seen_prior(), vec![vec!["structure".to_string()]]);
        assert_eq!(
            c.seen_prior(),
            vec![vec!["structure".to_string(), "industry_appeal".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_stage() {
        let structure = FakeAgent::new("structure", scored(80.0));
        let orch = orchestrator(vec![StageSpec::required(structure.clone())]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orch.run(&request(), &cancel).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(structure.calls(), 0);
        assert_eq!(
            result.failure,
            Some(RunFailure::Cancelled {
                stage: Some("structure".to_string())
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_stage_in_flight() {
        let slow = FakeAgent::slow("structure", scored(80.0), Duration::from_secs(60));
        let later = FakeAgent::new("industry_appeal", scored(90.0));
        let orch = orchestrator(vec![
            StageSpec::required(slow.clone()),
            StageSpec::required(later.clone()),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = orch.run(&request(), &cancel).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(later.calls(), 0);
        assert_eq!(
            result.stage("structure").unwrap().error,
            Some(StageError::Cancelled)
        );
        assert!(matches!(result.failure, Some(RunFailure::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_ends_run() {
        let slow = FakeAgent::slow("structure", scored(80.0), Duration::from_secs(60));
        let orch = orchestrator(vec![StageSpec::required(slow.clone())]);
        let request = request().with_deadline_ms(500);

        let result = orch.run(&request, &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(
            result.failure,
            Some(RunFailure::DeadlineExceeded {
                stage: Some("structure".to_string()),
                deadline_ms: 500
            })
        );
    }

    #[test]
    fn test_pipeline_validation() {
        let a = FakeAgent::new("structure", scored(1.0));
        assert!(matches!(
            Orchestrator::new(empty_registry(), vec![], ScoringPolicy::default()),
            Err(PipelineError::Empty)
        ));
        assert!(matches!(
            Orchestrator::new(
                empty_registry(),
                vec![StageSpec::required(a.clone()), StageSpec::optional(a.clone())],
                ScoringPolicy::default()
            ),
            Err(PipelineError::DuplicateStage(_))
        ));
        assert!(matches!(
            Orchestrator::new(
                empty_registry(),
                vec![StageSpec::required(a.clone()).with_min_depth(AnalysisDepth::Deep)],
                ScoringPolicy::default()
            ),
            Err(PipelineError::GatedRequiredStage { .. })
        ));
        let weights =
            ScoringPolicy::new(BTreeMap::from([("nonexistent".to_string(), 2.0)])).unwrap();
        assert!(matches!(
            Orchestrator::new(empty_registry(), vec![StageSpec::required(a)], weights),
            Err(PipelineError::UnknownWeightedStage(_))
        ));
    }
}
