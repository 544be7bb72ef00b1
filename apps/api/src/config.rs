use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Application configuration loaded from environment variables.
/// Startup aborts if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,
    /// Holds `prompts/` and `rollouts/`.
    pub analysis_config_dir: PathBuf,
    /// Read once; picks the orchestrated pipeline over the legacy reviewer.
    pub use_new_analyzer: bool,
    pub stage_timeout: Duration,
    /// Per-stage score weights, e.g. `structure=2,industry_appeal=1`.
    pub stage_weights: BTreeMap<String, f64>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            analysis_config_dir: std::env::var("ANALYSIS_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config")),
            use_new_analyzer: std::env::var("USE_NEW_ANALYZER")
                .map(|v| parse_bool_flag(&v))
                .unwrap_or(Ok(true))
                .context("USE_NEW_ANALYZER must be true or false")?,
            stage_timeout: Duration::from_secs(
                std::env::var("STAGE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .context("STAGE_TIMEOUT_SECS must be a positive number of seconds")?,
            ),
            stage_weights: std::env::var("STAGE_WEIGHTS")
                .map(|v| parse_stage_weights(&v))
                .unwrap_or_else(|_| Ok(BTreeMap::new()))
                .context("STAGE_WEIGHTS must look like `structure=2,industry_appeal=1`")?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

pub fn parse_bool_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("`{other}` is not a boolean"),
    }
}

pub fn parse_stage_weights(value: &str) -> Result<BTreeMap<String, f64>> {
    let mut weights = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (stage, weight) = pair
            .split_once('=')
            .with_context(|| format!("`{pair}` is missing `=`"))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .with_context(|| format!("weight for `{}` is not a number", stage.trim()))?;
        if weights.insert(stage.trim().to_string(), weight).is_some() {
            bail!("stage `{}` is weighted twice", stage.trim());
        }
    }
    Ok(weights)
}
