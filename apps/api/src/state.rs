use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use sqlx::PgPool;

use crate::analysis::Analyzer;
use crate::config::Config;
use crate::prompts::PromptRegistry;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub s3: S3Client,
    pub config: Config,
    /// Reloadable prompt configuration; each run takes one snapshot.
    pub registry: Arc<PromptRegistry>,
    /// Chosen once at startup by `select_analyzer`.
    pub analyzer: Arc<dyn Analyzer>,
}
