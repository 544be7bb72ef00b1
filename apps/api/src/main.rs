mod analysis;
mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod prompts;
mod routes;
mod service;
mod state;

use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analysis::{
    pipeline_prompt_names, select_analyzer, AnalyzerDeps, AnalyzerKind, ScoringPolicy,
    STAGE_VARIABLES,
};
use crate::config::Config;
use crate::db::create_pool;
use crate::llm_client::{AnthropicClient, LlmProvider};
use crate::prompts::PromptRegistry;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting review API v{}", env!("CARGO_PKG_VERSION"));

    // Prompt configuration must be valid before anything else starts.
    let registry = Arc::new(
        PromptRegistry::load(
            &config.analysis_config_dir,
            &pipeline_prompt_names(),
            &STAGE_VARIABLES,
        )
        .with_context(|| {
            format!(
                "Invalid prompt configuration under {}",
                config.analysis_config_dir.display()
            )
        })?,
    );

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    info!("S3 client initialized");

    // Initialize LLM provider
    let provider: Arc<dyn LlmProvider> = Arc::new(AnthropicClient::new(
        config.anthropic_api_key.clone(),
    )?);
    info!("LLM provider initialized (default model: {})", llm_client::DEFAULT_MODEL);

    // Pick the analyzer once; USE_NEW_ANALYZER is not re-read at runtime.
    let scoring = ScoringPolicy::new(config.stage_weights.clone()).context("Invalid STAGE_WEIGHTS")?;
    let analyzer = select_analyzer(
        AnalyzerKind::from_flag(config.use_new_analyzer),
        AnalyzerDeps {
            registry: Arc::clone(&registry),
            provider,
            stage_timeout: config.stage_timeout,
            scoring,
        },
    )
    .context("Invalid analysis pipeline")?;

    // Build app state
    let state = AppState {
        db,
        s3,
        config: config.clone(),
        registry,
        analyzer,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "review-api-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
