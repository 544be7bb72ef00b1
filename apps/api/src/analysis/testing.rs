//! In-memory fakes for exercising agents, the orchestrator, and analyzers
//! without a network or a config directory.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::analysis::agent::{StageAgent, StageContext};
use crate::analysis::model::StageResult;
use crate::llm_client::{Completion, CompletionRequest, LlmError, LlmProvider};
use crate::prompts::definition::{parse_pieces, Piece, PromptFile};
use crate::prompts::rollout::RolloutTable;
use crate::prompts::store::PromptStore;
use crate::prompts::{ModelParams, PromptCatalog, PromptDefinition};

/// Builds a catalog from `(name, version, template)` triples. Declared
/// variables are exactly the template's placeholders; no rollout policies.
pub fn catalog_with(prompts: &[(&str, &str, &str)]) -> PromptCatalog {
    let definitions = prompts.iter().map(|(name, version, template)| {
        let variables = parse_pieces(template)
            .unwrap()
            .into_iter()
            .filter_map(|p| match p {
                Piece::Var(v) => Some(v),
                Piece::Text(_) => None,
            })
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let file = PromptFile {
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            system: String::new(),
            template: template.to_string(),
            variables,
            model: ModelParams::default(),
        };
        PromptDefinition::from_file(Path::new("<test>"), file).unwrap()
    });
    let store = PromptStore::from_definitions(definitions).unwrap();
    PromptCatalog::new(store, RolloutTable::default())
}

enum Reply {
    Text(String),
    Fail,
}

/// Answers by the first rule whose needle appears in the system or user
/// prompt. No matching rule is a provider error.
#[derive(Default)]
pub struct ScriptedProvider {
    rules: Vec<(String, Reply)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, needle: &str, text: &str) -> Self {
        self.rules
            .push((needle.to_string(), Reply::Text(text.to_string())));
        self
    }

    pub fn fail(mut self, needle: &str) -> Self {
        self.rules.push((needle.to_string(), Reply::Fail));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.rules.iter().find(|(needle, _)| {
            request.prompt.contains(needle.as_str()) || request.system.contains(needle.as_str())
        });
        match reply {
            Some((_, Reply::Text(text))) => Ok(Completion {
                text: text.clone(),
                input_tokens: 10,
                output_tokens: 10,
            }),
            Some((_, Reply::Fail)) | None => Err(LlmError::Api {
                status: 500,
                message: "scripted failure".to_string(),
            }),
        }
    }
}

/// A stage agent that returns a canned result, optionally after a delay.
pub struct FakeAgent {
    name: String,
    result: StageResult,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen_prior: Mutex<Vec<Vec<String>>>,
}

impl FakeAgent {
    pub fn new(name: &str, result: StageResult) -> Arc<Self> {
        Arc::new(Self::build(name, result, None))
    }

    pub fn slow(name: &str, result: StageResult, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(name, result, Some(delay)))
    }

    fn build(name: &str, result: StageResult, delay: Option<Duration>) -> Self {
        Self {
            name: name.to_string(),
            result: StageResult {
                stage: name.to_string(),
                ..result
            },
            delay,
            calls: AtomicUsize::new(0),
            seen_prior: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stage names present in `ctx.prior` for each call.
    pub fn seen_prior(&self) -> Vec<Vec<String>> {
        self.seen_prior.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageAgent for FakeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _resume_text: &str, ctx: &StageContext<'_>) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_prior
            .lock()
            .unwrap()
            .push(ctx.prior.iter().map(|r| r.stage.clone()).collect());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return StageResult::failed(
                        self.name.clone(),
                        crate::analysis::model::StageError::Cancelled,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.result.clone()
    }
}
