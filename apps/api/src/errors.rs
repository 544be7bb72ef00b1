use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::analysis::AnalyzerError;
use crate::prompts::ConfigError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalyzerError),

    #[error("Prompt configuration error: {0}")]
    PromptConfig(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Analysis(e) => {
                let status = match e {
                    AnalyzerError::Validation(_) => StatusCode::BAD_REQUEST,
                    AnalyzerError::Provider { .. } => StatusCode::BAD_GATEWAY,
                    AnalyzerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    AnalyzerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                    AnalyzerError::Adapter(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!("Analysis error (retryable: {}): {e}", e.is_retryable());
                }
                (status, e.code(), e.to_string())
            }
            AppError::PromptConfig(e) => {
                tracing::error!("Prompt configuration error: {e}");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "PROMPT_CONFIG_ERROR",
                    e.to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::S3(msg) => {
                tracing::error!("S3 error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "S3_ERROR",
                    "A storage error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
