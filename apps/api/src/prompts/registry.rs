//! Prompt Registry — the one shared, reloadable view of prompt configuration.
//!
//! Readers take an `Arc<PromptCatalog>` snapshot and keep it for a whole run.
//! `reload` builds a complete new catalog off to the side and publishes it with
//! a single pointer swap, so nobody ever observes half of a reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::prompts::error::{ConfigError, PromptError};
use crate::prompts::rollout::{Resolution, RolloutTable, VersionResolver};
use crate::prompts::store::PromptStore;

pub const PROMPTS_SUBDIR: &str = "prompts";
pub const ROLLOUTS_SUBDIR: &str = "rollouts";

/// A consistent pair of prompt definitions and rollout policies.
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    store: PromptStore,
    rollouts: RolloutTable,
    loaded_at: DateTime<Utc>,
}

impl PromptCatalog {
    /// Loads `<root>/prompts` and `<root>/rollouts`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let store = PromptStore::load(&root.join(PROMPTS_SUBDIR))?;
        let rollouts = RolloutTable::load(&root.join(ROLLOUTS_SUBDIR), &store)?;
        Ok(Self::new(store, rollouts))
    }

    pub fn new(store: PromptStore, rollouts: RolloutTable) -> Self {
        Self {
            store,
            rollouts,
            loaded_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &PromptStore {
        &self.store
    }

    pub fn rollouts(&self) -> &RolloutTable {
        &self.rollouts
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn resolve(&self, prompt: &str, context_key: &str) -> Result<Resolution, PromptError> {
        VersionResolver::new(&self.store, &self.rollouts).resolve(prompt, context_key)
    }

    /// Every `required` prompt has at least one version, and every version
    /// declares only variables from `supplied`.
    fn ensure_prompts(&self, required: &[String], supplied: &[String]) -> Result<(), ConfigError> {
        for name in required {
            let definitions = self.store.definitions(name);
            if definitions.is_empty() {
                return Err(ConfigError::MissingPrompt { name: name.clone() });
            }
            for definition in definitions {
                if let Some(unsupported) = definition
                    .variables
                    .iter()
                    .find(|var| !supplied.contains(*var))
                {
                    let path = self
                        .store
                        .source(name, &definition.version)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| {
                            PathBuf::from(format!("{name}@{}", definition.version))
                        });
                    return Err(ConfigError::invalid(
                        path,
                        "variables",
                        format!(
                            "`{unsupported}` cannot be supplied to a pipeline stage (allowed: {})",
                            supplied.join(", ")
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

pub struct PromptRegistry {
    root: PathBuf,
    required: Vec<String>,
    supplied: Vec<String>,
    current: ArcSwap<PromptCatalog>,
}

impl PromptRegistry {
    /// Loads the catalog under `root`, failing if any prompt in `required` is
    /// absent or declares a variable outside `supplied`.
    pub fn load(
        root: impl Into<PathBuf>,
        required: &[&str],
        supplied: &[&str],
    ) -> Result<Self, ConfigError> {
        let root = root.into();
        let catalog = PromptCatalog::load(&root)?;
        Self::with_catalog(root, required, supplied, catalog)
    }

    /// Wraps an already-built catalog. `reload` still reads from `root`.
    pub fn with_catalog(
        root: impl Into<PathBuf>,
        required: &[&str],
        supplied: &[&str],
        catalog: PromptCatalog,
    ) -> Result<Self, ConfigError> {
        let required: Vec<String> = required.iter().map(|s| s.to_string()).collect();
        let supplied: Vec<String> = supplied.iter().map(|s| s.to_string()).collect();
        catalog.ensure_prompts(&required, &supplied)?;
        Ok(Self {
            root: root.into(),
            required,
            supplied,
            current: ArcSwap::from_pointee(catalog),
        })
    }

    /// The catalog in effect right now. Hold on to it for the duration of a run.
    pub fn snapshot(&self) -> Arc<PromptCatalog> {
        self.current.load_full()
    }

    /// Re-reads configuration from disk and publishes it atomically.
    /// On any error the previous catalog stays in effect.
    pub fn reload(&self) -> Result<Arc<PromptCatalog>, ConfigError> {
        let next = PromptCatalog::load(&self.root)
            .and_then(|catalog| {
                catalog
                    .ensure_prompts(&self.required, &self.supplied)
                    .map(|_| catalog)
            })
            .map_err(|e| {
                error!("Prompt reload rejected, keeping previous configuration: {e}");
                e
            })?;
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        info!(
            "Prompt configuration reloaded from {} ({} prompts, {} rollout policies)",
            self.root.display(),
            next.store().names().len(),
            next.rollouts().len()
        );
        Ok(next)
    }
}
