use std::path::PathBuf;

use thiserror::Error;

/// Load-time failures. Any of these blocks startup (or rejects a reload);
/// none of them can surface while an analysis is running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("{}: malformed YAML: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: invalid field `{field}`: {message}", .path.display())]
    Invalid {
        path: PathBuf,
        field: String,
        message: String,
    },

    #[error(
        "{}: duplicate prompt {name}@{version} (already defined in {})",
        .path.display(),
        .first.display()
    )]
    Duplicate {
        path: PathBuf,
        first: PathBuf,
        name: String,
        version: String,
    },

    #[error("prompt `{name}` is required by the analysis pipeline but no version is loaded")]
    MissingPrompt { name: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        path: impl Into<PathBuf>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ConfigError::Invalid {
            path: path.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Call-time prompt failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("prompt `{name}` not found (version {})", .version.as_deref().unwrap_or("any"))]
    NotFound {
        name: String,
        version: Option<String>,
    },

    #[error("prompt `{prompt}` requires variable `{variable}` but it was not supplied")]
    MissingVariable { prompt: String, variable: String },

    #[error("prompt `{prompt}` does not declare variable `{variable}`")]
    UnknownVariable { prompt: String, variable: String },
}
