// Analysis pipeline: request/result model, stage agents, the orchestrator,
// and the Analyzer contract with its legacy adapter.

pub mod agent;
pub mod analyzer;
pub mod legacy;
pub mod model;
pub mod orchestrator;
pub mod scoring;
pub mod stages;

#[cfg(test)]
pub(crate) mod testing;

pub use analyzer::{select_analyzer, Analyzer, AnalyzerDeps, AnalyzerError, AnalyzerKind};
pub use model::{AnalysisDepth, AnalysisRequest, AnalysisResult, RunStatus};
pub use scoring::ScoringPolicy;
pub use agent::STAGE_VARIABLES;
pub use stages::pipeline_prompt_names;
