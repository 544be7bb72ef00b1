//! Read-only view of the loaded prompt catalog for the admin endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::prompts::{PromptCatalog, RolloutPolicy};

#[derive(Debug, Serialize)]
pub struct CatalogSummary {
    pub loaded_at: DateTime<Utc>,
    pub prompts: Vec<PromptSummary>,
}

#[derive(Debug, Serialize)]
pub struct PromptSummary {
    pub name: String,
    /// Ascending.
    pub versions: Vec<String>,
    pub latest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutSummary>,
}

#[derive(Debug, Serialize)]
pub struct RolloutSummary {
    pub shares: Vec<ShareSummary>,
    pub default_version: Option<String>,
    /// Pinned context keys are requester identifiers, so only the count is exposed.
    pub pinned_contexts: usize,
}

#[derive(Debug, Serialize)]
pub struct ShareSummary {
    pub version: String,
    pub percent: u8,
}

fn rollout_summary(policy: &RolloutPolicy) -> RolloutSummary {
    RolloutSummary {
        shares: policy
            .shares
            .iter()
            .map(|s| ShareSummary {
                version: s.version.to_string(),
                percent: s.share,
            })
            .collect(),
        default_version: policy.default_version.as_ref().map(|v| v.to_string()),
        pinned_contexts: policy.pinned.len(),
    }
}

pub fn summarize(catalog: &PromptCatalog) -> CatalogSummary {
    let store = catalog.store();
    let prompts = store
        .names()
        .into_iter()
        .map(|name| {
            let versions: Vec<String> = store.versions(name).iter().map(|v| v.to_string()).collect();
            PromptSummary {
                name: name.to_string(),
                latest: versions.last().cloned().unwrap_or_default(),
                versions,
                rollout: catalog.rollouts().policy(name).map(rollout_summary),
            }
        })
        .collect();
    CatalogSummary {
        loaded_at: catalog.loaded_at(),
        prompts,
    }
}
