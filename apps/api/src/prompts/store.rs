//! Prompt Store — loads every prompt definition under a directory tree, validates
//! it, and serves parsed definitions from memory.
//!
//! The store is an immutable value: "reloading" means building a new store and
//! swapping it in through `PromptRegistry`, never mutating this one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::prompts::definition::{Piece, PromptDefinition, PromptVersion};
use crate::prompts::error::{ConfigError, PromptError};

/// Variables supplied to `render`. Ordered so error reporting is deterministic.
pub type PromptVariables = BTreeMap<String, String>;

/// The two halves of a rendered prompt, ready for the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Default, Clone)]
pub struct PromptStore {
    prompts: HashMap<String, BTreeMap<PromptVersion, Arc<PromptDefinition>>>,
    sources: HashMap<(String, PromptVersion), PathBuf>,
}

impl PromptStore {
    /// Walks `dir` recursively and loads every `*.yaml` / `*.yml` file.
    /// The first malformed file aborts the whole load.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        if !dir.is_dir() {
            return Err(ConfigError::Io {
                path: dir.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "prompt directory does not exist",
                ),
            });
        }

        let mut store = PromptStore::default();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|source| ConfigError::Walk {
                path: dir.to_path_buf(),
                source,
            })?;
            if !entry.file_type().is_file() || !is_yaml(entry.path()) {
                continue;
            }

            let path = entry.path();
            let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let definition = PromptDefinition::parse(path, &yaml)?;

            let key = (definition.name.clone(), definition.version.clone());
            if let Some(first) = store.sources.get(&key) {
                return Err(ConfigError::Duplicate {
                    path: path.to_path_buf(),
                    first: first.clone(),
                    name: definition.name,
                    version: definition.version.to_string(),
                });
            }
            debug!(
                "Loaded prompt {}@{} from {}",
                definition.name,
                definition.version,
                path.display()
            );
            store.sources.insert(key, path.to_path_buf());
            store.insert(definition);
        }

        info!(
            "Prompt store loaded {} prompt(s), {} version(s) from {}",
            store.prompts.len(),
            store.sources.len(),
            dir.display()
        );
        Ok(store)
    }

    /// Builds a store from already-validated definitions.
    #[cfg(test)]
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = PromptDefinition>,
    ) -> Result<Self, ConfigError> {
        let mut store = PromptStore::default();
        for definition in definitions {
            if store.contains(&definition.name, &definition.version) {
                return Err(ConfigError::Duplicate {
                    path: PathBuf::from("<memory>"),
                    first: PathBuf::from("<memory>"),
                    name: definition.name,
                    version: definition.version.to_string(),
                });
            }
            store.insert(definition);
        }
        Ok(store)
    }

    fn insert(&mut self, definition: PromptDefinition) {
        self.prompts
            .entry(definition.name.clone())
            .or_default()
            .insert(definition.version.clone(), Arc::new(definition));
    }

    pub fn get(
        &self,
        name: &str,
        version: &PromptVersion,
    ) -> Result<Arc<PromptDefinition>, PromptError> {
        self.prompts
            .get(name)
            .and_then(|versions| versions.get(version))
            .cloned()
            .ok_or_else(|| PromptError::NotFound {
                name: name.to_string(),
                version: Some(version.to_string()),
            })
    }

    /// Highest loaded version of `name`.
    pub fn latest(&self, name: &str) -> Result<Arc<PromptDefinition>, PromptError> {
        self.prompts
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| PromptError::NotFound {
                name: name.to_string(),
                version: None,
            })
    }

    /// File a definition was loaded from. `None` for in-memory stores.
    pub fn source(&self, name: &str, version: &PromptVersion) -> Option<&Path> {
        self.sources
            .get(&(name.to_string(), version.clone()))
            .map(PathBuf::as_path)
    }

    pub fn contains(&self, name: &str, version: &PromptVersion) -> bool {
        self.prompts
            .get(name)
            .is_some_and(|versions| versions.contains_key(version))
    }

    /// Every loaded version of `name`, lowest first.
    pub fn definitions(&self, name: &str) -> Vec<&PromptDefinition> {
        self.prompts
            .get(name)
            .map(|versions| versions.values().map(Arc::as_ref).collect())
            .unwrap_or_default()
    }

    /// Loaded versions of `name`, lowest first.
    pub fn versions(&self, name: &str) -> Vec<&PromptVersion> {
        self.prompts
            .get(name)
            .map(|versions| versions.keys().collect())
            .unwrap_or_default()
    }

    /// Loaded prompt names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prompts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Substitutes `variables` into `definition`.
///
/// Strict: every declared variable must be supplied (`MissingVariable`) and
/// nothing undeclared may be supplied (`UnknownVariable`).
pub fn render(
    definition: &PromptDefinition,
    variables: &PromptVariables,
) -> Result<RenderedPrompt, PromptError> {
    if let Some(unknown) = variables
        .keys()
        .find(|k| !definition.variables.contains(k.as_str()))
    {
        return Err(PromptError::UnknownVariable {
            prompt: definition.name.clone(),
            variable: unknown.clone(),
        });
    }
    if let Some(missing) = definition
        .variables
        .iter()
        .find(|v| !variables.contains_key(v.as_str()))
    {
        return Err(PromptError::MissingVariable {
            prompt: definition.name.clone(),
            variable: missing.clone(),
        });
    }

    Ok(RenderedPrompt {
        system: substitute(&definition.system_pieces, variables),
        user: substitute(&definition.template_pieces, variables),
    })
}

fn substitute(pieces: &[Piece], variables: &PromptVariables) -> String {
    let mut out = String::new();
    for piece in pieces {
        match piece {
            Piece::Text(text) => out.push_str(text),
            // Presence was checked by `render`.
            Piece::Var(name) => out.push_str(variables.get(name).map(String::as_str).unwrap_or("")),
        }
    }
    out
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
