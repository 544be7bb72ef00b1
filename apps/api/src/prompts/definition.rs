//! Prompt definitions as they live on disk, plus the load-time checks that keep
//! a template and its declared variables in lock-step.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::prompts::error::ConfigError;

/// Ordered prompt version: `v1`, `v2`, `1.4.0`, `v2.1`.
///
/// Components compare numerically, so `v10` sorts above `v9`. Missing trailing
/// components count as zero (`v2` and `v2.0` rank the same; the raw text breaks
/// the tie so the ordering stays total).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PromptVersion {
    raw: String,
    parts: Vec<u64>,
}

impl PromptVersion {
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for PromptVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let digits = raw
            .strip_prefix('v')
            .or_else(|| raw.strip_prefix('V'))
            .unwrap_or(raw);
        if digits.is_empty() {
            return Err(format!("`{s}` is not a version (expected e.g. `v2` or `1.3.0`)"));
        }
        let parts = digits
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("`{s}` is not a version (expected e.g. `v2` or `1.3.0`)"))?;
        Ok(PromptVersion {
            raw: raw.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for PromptVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PromptVersion> for String {
    fn from(value: PromptVersion) -> Self {
        value.raw
    }
}

impl fmt::Display for PromptVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for PromptVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.raw.cmp(&other.raw)
    }
}

impl PartialOrd for PromptVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sampling parameters forwarded to the LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Overrides the provider's default model when set.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            model: None,
        }
    }
}

/// On-disk shape of a prompt file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PromptFile {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system: String,
    pub template: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub model: ModelParams,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Piece {
    Text(String),
    Var(String),
}

/// A validated prompt. The placeholders in `system` + `template` are exactly
/// `variables`; anything else is rejected when the file is loaded.
#[derive(Debug, Clone)]
pub struct PromptDefinition {
    pub name: String,
    pub version: PromptVersion,
    pub description: Option<String>,
    pub system: String,
    pub template: String,
    pub variables: BTreeSet<String>,
    pub model: ModelParams,
    pub(crate) system_pieces: Vec<Piece>,
    pub(crate) template_pieces: Vec<Piece>,
}

impl PromptDefinition {
    /// Parses and validates one YAML prompt file. `path` is only used for error reporting.
    pub fn parse(path: &Path, yaml: &str) -> Result<Self, ConfigError> {
        let file: PromptFile = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_file(path, file)
    }

    pub(crate) fn from_file(path: &Path, file: PromptFile) -> Result<Self, ConfigError> {
        let name = file.name.trim().to_string();
        if !is_prompt_name(&name) {
            return Err(ConfigError::invalid(
                path,
                "name",
                format!("`{}` must be non-empty lowercase snake_case", file.name),
            ));
        }

        let version: PromptVersion = file
            .version
            .parse()
            .map_err(|msg| ConfigError::invalid(path, "version", msg))?;

        if file.template.trim().is_empty() {
            return Err(ConfigError::invalid(path, "template", "must not be empty"));
        }

        let mut variables = BTreeSet::new();
        for var in &file.variables {
            if !is_identifier(var) {
                return Err(ConfigError::invalid(
                    path,
                    "variables",
                    format!("`{var}` is not a valid variable name"),
                ));
            }
            if !variables.insert(var.clone()) {
                return Err(ConfigError::invalid(
                    path,
                    "variables",
                    format!("`{var}` is declared more than once"),
                ));
            }
        }

        let system_pieces =
            parse_pieces(&file.system).map_err(|msg| ConfigError::invalid(path, "system", msg))?;
        let template_pieces = parse_pieces(&file.template)
            .map_err(|msg| ConfigError::invalid(path, "template", msg))?;

        let referenced: BTreeSet<String> = system_pieces
            .iter()
            .chain(template_pieces.iter())
            .filter_map(|p| match p {
                Piece::Var(v) => Some(v.clone()),
                Piece::Text(_) => None,
            })
            .collect();

        let undeclared: Vec<&str> = referenced.difference(&variables).map(String::as_str).collect();
        if !undeclared.is_empty() {
            return Err(ConfigError::invalid(
                path,
                "variables",
                format!(
                    "template references undeclared variable(s): {}",
                    undeclared.join(", ")
                ),
            ));
        }
        let unused: Vec<&str> = variables.difference(&referenced).map(String::as_str).collect();
        if !unused.is_empty() {
            return Err(ConfigError::invalid(
                path,
                "variables",
                format!(
                    "declared variable(s) never used in the template: {}",
                    unused.join(", ")
                ),
            ));
        }

        if !file.model.temperature.is_finite() || !(0.0..=1.0).contains(&file.model.temperature) {
            return Err(ConfigError::invalid(
                path,
                "model.temperature",
                format!("{} is outside 0.0..=1.0", file.model.temperature),
            ));
        }
        if file.model.max_tokens == 0 {
            return Err(ConfigError::invalid(path, "model.max_tokens", "must be positive"));
        }

        Ok(PromptDefinition {
            name,
            version,
            description: file.description,
            system: file.system,
            template: file.template,
            variables,
            model: file.model,
            system_pieces,
            template_pieces,
        })
    }
}

fn is_prompt_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Splits template text into literal runs and `{{ variable }}` placeholders.
/// Single braces are literal, so JSON examples inside a template are safe.
pub(crate) fn parse_pieces(text: &str) -> Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            pieces.push(Piece::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| "unterminated `{{` placeholder".to_string())?;
        let name = after[..end].trim();
        if !is_identifier(name) {
            return Err(format!("`{{{{{name}}}}}` is not a valid placeholder"));
        }
        pieces.push(Piece::Var(name.to_string()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest.to_string()));
    }
    Ok(pieces)
}
