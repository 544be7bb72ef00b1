//! Stage Agents — one analysis concern each, run against a resolved prompt.
//!
//! An agent never returns `Err`: every failure mode (prompt resolution,
//! provider error, timeout, unparseable output, cancellation) is folded into a
//! `StageResult` with `status = failed`, so the orchestrator applies one policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analysis::model::{
    AnalysisRequest, FeedbackItem, PromptRef, StageError, StageResult, MAX_SCORE, MIN_SCORE,
};
use crate::llm_client::{strip_json_fences, CompletionRequest, LlmProvider};
use crate::prompts::{render, PromptCatalog, PromptDefinition, PromptVariables};

/// Variables a stage prompt may declare.
pub const VAR_RESUME_TEXT: &str = "resume_text";
pub const VAR_INDUSTRY: &str = "industry";
pub const VAR_DEPTH: &str = "depth";
pub const VAR_FOCUS_AREAS: &str = "focus_areas";
pub const VAR_PRIOR_FINDINGS: &str = "prior_findings";

/// Every variable `StageContext::variables_for` can fill. Stage prompts that
/// declare anything else are rejected when the registry loads.
pub const STAGE_VARIABLES: [&str; 5] = [
    VAR_RESUME_TEXT,
    VAR_INDUSTRY,
    VAR_DEPTH,
    VAR_FOCUS_AREAS,
    VAR_PRIOR_FINDINGS,
];

/// Everything a stage can see for one run. Built fresh per stage by the
/// orchestrator; `prior` holds the results of the stages before this one.
pub struct StageContext<'a> {
    pub catalog: &'a PromptCatalog,
    pub request: &'a AnalysisRequest,
    pub prior: &'a [StageResult],
    pub cancel: &'a CancellationToken,
}

impl StageContext<'_> {
    /// Picks the values for exactly the variables `definition` declares.
    /// Undeclared context stays out so `render`'s strict check only fires on real drift.
    pub fn variables_for(&self, definition: &PromptDefinition, resume_text: &str) -> PromptVariables {
        definition
            .variables
            .iter()
            .filter_map(|name| {
                let value = match name.as_str() {
                    VAR_RESUME_TEXT => resume_text.to_string(),
                    VAR_INDUSTRY => self.request.industry.trim().to_string(),
                    VAR_DEPTH => self.request.depth.as_str().to_string(),
                    VAR_FOCUS_AREAS => format_focus_areas(&self.request.focus_areas),
                    VAR_PRIOR_FINDINGS => format_prior_findings(self.prior),
                    _ => return None,
                };
                Some((name.clone(), value))
            })
            .collect()
    }
}

fn format_focus_areas(focus_areas: &[String]) -> String {
    if focus_areas.is_empty() {
        "none specified".to_string()
    } else {
        focus_areas.join(", ")
    }
}

/// Renders earlier successful stages as a compact bullet list for later prompts.
pub fn format_prior_findings(prior: &[StageResult]) -> String {
    let mut lines = Vec::new();
    for result in prior.iter().filter(|r| r.is_ok()) {
        let scores = result
            .scores
            .iter()
            .map(|(k, v)| format!("{k}={v:.0}"))
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("[{}] scores: {}", result.stage, scores));
        for item in &result.feedback {
            lines.push(format!(
                "- [{}] {}: {} ({:?})",
                result.stage, item.area, item.message, item.priority
            ));
        }
    }
    if lines.is_empty() {
        "none".to_string()
    } else {
        lines.join("\n")
    }
}

#[async_trait]
pub trait StageAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, resume_text: &str, ctx: &StageContext<'_>) -> StageResult;
}

/// Structured output every stage prompt must ask the model for.
#[derive(Debug, Deserialize)]
struct StageOutput {
    scores: BTreeMap<String, f64>,
    #[serde(default)]
    feedback: Vec<FeedbackItem>,
}

/// Parses a completion into scores + feedback, enforcing the 0–100 bound.
pub fn parse_stage_output(text: &str) -> Result<(BTreeMap<String, f64>, Vec<FeedbackItem>), String> {
    let output: StageOutput =
        serde_json::from_str(strip_json_fences(text)).map_err(|e| e.to_string())?;
    if output.scores.is_empty() {
        return Err("no scores returned".to_string());
    }
    if let Some((name, value)) = output
        .scores
        .iter()
        .find(|(_, v)| !v.is_finite() || **v < MIN_SCORE || **v > MAX_SCORE)
    {
        return Err(format!("score `{name}` = {value} is outside 0–100"));
    }
    if output.feedback.iter().any(|f| f.message.trim().is_empty()) {
        return Err("feedback item with empty message".to_string());
    }
    Ok((output.scores, output.feedback))
}

/// The standard agent: resolve prompt → render → call provider → parse.
pub struct LlmStageAgent {
    name: String,
    prompt_name: String,
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmStageAgent {
    pub fn new(
        name: impl Into<String>,
        prompt_name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            prompt_name: prompt_name.into(),
            provider,
            timeout,
        }
    }

    async fn call(
        &self,
        resume_text: &str,
        ctx: &StageContext<'_>,
    ) -> (Option<PromptRef>, Result<StageResult, StageError>) {
        let resolution = match ctx
            .catalog
            .resolve(&self.prompt_name, &ctx.request.requester_key)
        {
            Ok(r) => r,
            Err(e) => {
                return (
                    None,
                    Err(StageError::Prompt {
                        message: e.to_string(),
                    }),
                )
            }
        };
        let definition = resolution.definition;
        let prompt_ref = Some(PromptRef {
            name: definition.name.clone(),
            version: definition.version.to_string(),
        });

        let variables = ctx.variables_for(&definition, resume_text);
        let rendered = match render(&definition, &variables) {
            Ok(r) => r,
            Err(e) => {
                return (
                    prompt_ref,
                    Err(StageError::Prompt {
                        message: e.to_string(),
                    }),
                )
            }
        };

        debug!(
            stage = %self.name,
            prompt = %definition.name,
            version = %definition.version,
            reason = ?resolution.reason,
            "Calling provider"
        );

        let request = CompletionRequest {
            system: &rendered.system,
            prompt: &rendered.user,
            params: &definition.model,
            timeout: self.timeout,
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(StageError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.provider.complete(request)) => match res {
                Err(_) => Err(StageError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }),
                Ok(Err(e)) => Err(StageError::Provider {
                    message: e.to_string(),
                }),
                Ok(Ok(completion)) => parse_stage_output(&completion.text)
                    .map(|(scores, feedback)| StageResult::ok(self.name.clone(), scores, feedback))
                    .map_err(|message| StageError::Parse { message }),
            },
        };

        (prompt_ref, outcome)
    }
}

#[async_trait]
impl StageAgent for LlmStageAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, resume_text: &str, ctx: &StageContext<'_>) -> StageResult {
        let started = Instant::now();
        let (prompt_ref, outcome) = self.call(resume_text, ctx).await;
        let elapsed = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                warn!(stage = %self.name, "Stage failed: {error}");
                StageResult::failed(self.name.clone(), error)
            }
        };
        result.with_prompt(prompt_ref).with_duration_ms(elapsed)
    }
}
