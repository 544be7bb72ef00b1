// Prompt configuration: definitions on disk, rollout policies, and the
// reloadable registry the analysis pipeline reads from.

pub mod definition;
pub mod error;
pub mod registry;
pub mod rollout;
pub mod store;

pub use definition::{ModelParams, PromptDefinition};
pub use error::ConfigError;
pub use registry::{PromptCatalog, PromptRegistry};
pub use rollout::RolloutPolicy;
pub use store::{render, PromptVariables};
