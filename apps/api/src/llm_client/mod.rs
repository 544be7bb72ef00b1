/// LLM Client — the single point of entry for all model calls in the review service.
///
/// ARCHITECTURAL RULE: stage agents and the legacy reviewer talk to `dyn LlmProvider`
/// only. `AnthropicClient` is the production implementation; tests plug in fakes.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::prompts::ModelParams;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Used when a prompt definition does not name a model.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("LLM returned empty content")]
    EmptyContent,
}

/// One provider call: rendered prompt, declared model parameters, and a deadline.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system: &'a str,
    pub prompt: &'a str,
    pub params: &'a ModelParams,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Completion {
    /// The completion text with any markdown code fences removed.
    pub fn json_body(&self) -> &str {
        strip_json_fences(&self.text)
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError>;
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "is_blank")]
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// Anthropic Messages API client with retry on 429/5xx.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().build()?,
            api_key,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    /// Retries on 429 (rate limit) and 5xx errors with exponential backoff.
    /// Each attempt carries the request timeout; callers bound the total.
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, LlmError> {
        let request_body = AnthropicRequest {
            model: request.params.model.as_deref().unwrap_or(DEFAULT_MODEL),
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
            system: request.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: request.prompt,
            }],
        };

        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s
                let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "LLM call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(ANTHROPIC_API_URL)
                .timeout(request.timeout)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("LLM API returned {}: {}", status, body);
                last_error = Some(LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<AnthropicError>(&body)
                    .map(|e| e.error.message)
                    .unwrap_or(body);
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: AnthropicResponse = response.json().await?;
            let text = body
                .content
                .into_iter()
                .find(|b| b.block_type == "text")
                .and_then(|b| b.text)
                .filter(|t| !t.trim().is_empty())
                .ok_or(LlmError::EmptyContent)?;

            debug!(
                "LLM call succeeded: input_tokens={}, output_tokens={}",
                body.usage.input_tokens, body.usage.output_tokens
            );

            return Ok(Completion {
                text,
                input_tokens: body.usage.input_tokens,
                output_tokens: body.usage.output_tokens,
            });
        }

        Err(last_error.unwrap_or(LlmError::RateLimited {
            retries: MAX_RETRIES,
        }))
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}
