//! The fixed analysis pipeline: which stages exist, in what order, and which
//! of them a run cannot do without.

use std::sync::Arc;
use std::time::Duration;

use crate::analysis::agent::LlmStageAgent;
use crate::analysis::model::AnalysisDepth;
use crate::analysis::orchestrator::StageSpec;
use crate::llm_client::LlmProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Layout, section order, length, readability.
    Structure,
    /// How the resume lands with hiring managers in the target industry.
    IndustryAppeal,
    /// Quantified outcomes vs. duty lists.
    AchievementImpact,
    /// Parseability by applicant tracking systems.
    AtsCompatibility,
}

impl StageKind {
    /// Pipeline order. Later stages see earlier findings.
    pub const PIPELINE: [StageKind; 4] = [
        StageKind::Structure,
        StageKind::IndustryAppeal,
        StageKind::AchievementImpact,
        StageKind::AtsCompatibility,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Structure => "structure",
            StageKind::IndustryAppeal => "industry_appeal",
            StageKind::AchievementImpact => "achievement_impact",
            StageKind::AtsCompatibility => "ats_compatibility",
        }
    }

    pub fn prompt_name(&self) -> &'static str {
        match self {
            StageKind::Structure => "structure_analysis",
            StageKind::IndustryAppeal => "industry_appeal_analysis",
            StageKind::AchievementImpact => "impact_analysis",
            StageKind::AtsCompatibility => "ats_analysis",
        }
    }

    pub fn required(&self) -> bool {
        matches!(self, StageKind::Structure | StageKind::IndustryAppeal)
    }

    pub fn min_depth(&self) -> AnalysisDepth {
        match self {
            StageKind::Structure | StageKind::IndustryAppeal => AnalysisDepth::Quick,
            StageKind::AchievementImpact => AnalysisDepth::Standard,
            StageKind::AtsCompatibility => AnalysisDepth::Deep,
        }
    }
}

/// Prompt names the pipeline cannot start without.
pub fn pipeline_prompt_names() -> Vec<&'static str> {
    StageKind::PIPELINE.iter().map(StageKind::prompt_name).collect()
}

pub fn default_pipeline(provider: Arc<dyn LlmProvider>, stage_timeout: Duration) -> Vec<StageSpec> {
    StageKind::PIPELINE
        .iter()
        .map(|kind| {
            let agent = Arc::new(LlmStageAgent::new(
                kind.name(),
                kind.prompt_name(),
                Arc::clone(&provider),
                stage_timeout,
            ));
            let spec = if kind.required() {
                StageSpec::required(agent)
            } else {
                StageSpec::optional(agent)
            };
            spec.with_min_depth(kind.min_depth())
        })
        .collect()
}
