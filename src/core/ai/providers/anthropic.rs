//! Anthropic Provider Implementation
//!
//! Implements the AiProvider trait for Anthropic's Claude models.
//! Anthropic offers no embedding endpoint, so this provider is
//! chat-only in the failover pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ProviderConfig;
use crate::core::ai::provider::{
    AiProvider, CompletionRequest, CompletionResponse, EmbeddingMode, FinishReason, TokenUsage,
};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Anthropic Provider
// =============================================================================

/// Anthropic API provider for Claude models
pub struct AnthropicProvider {
    /// API key
    api_key: String,
    /// Base URL for API requests
    base_url: String,
    /// Default model
    default_model: String,
    /// HTTP client
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Default Anthropic API base URL
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com/v1";

    /// API version header value
    pub const API_VERSION: &'static str = "2023-06-01";

    /// Creates a new Anthropic provider
    pub fn new(config: ProviderConfig) -> CoreResult<Self> {
        let api_key = config.api_key.ok_or_else(|| {
            CoreError::ValidationError("Anthropic API key is required".to_string())
        })?;

        if api_key.is_empty() {
            return Err(CoreError::ValidationError(
                "Anthropic API key cannot be empty".to_string(),
            ));
        }

        let base_url = config
            .base_url
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());

        let default_model = config
            .model
            .unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string());
        let timeout_secs = config.timeout_secs.unwrap_or(60);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url,
            default_model,
            client,
        })
    }
}

// =============================================================================
// Anthropic API Types
// =============================================================================

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

// =============================================================================
// AiProvider Implementation
// =============================================================================

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let model = request.model.unwrap_or_else(|| self.default_model.clone());

        // Anthropic takes system as a top-level field and only
        // user/assistant roles in the messages array.
        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| ApiMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();

        let api_request = MessagesRequest {
            model,
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system.clone(),
            temperature: request.temperature,
        };

        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let error: ApiError = serde_json::from_str(&body).unwrap_or(ApiError {
                error: ApiErrorDetail {
                    message: body.clone(),
                    error_type: None,
                },
            });

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(CoreError::RateLimited {
                    retry_after_secs: retry_after.unwrap_or(60),
                    message: format!("Anthropic rate limit: {}", error.error.message),
                });
            }

            let error_type = error.error.error_type.as_deref().unwrap_or("unknown");
            return Err(CoreError::AiRequestFailed(format!(
                "Anthropic API error ({}; type={}): {}",
                status, error_type, error.error.message
            )));
        }

        let api_response: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to parse response: {}", e)))?;

        let text = api_response
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let finish_reason = match api_response.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };

        let usage = api_response
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        Ok(CompletionResponse {
            text,
            model: api_response.model,
            usage,
            finish_reason,
        })
    }

    async fn embed(&self, _texts: Vec<String>, _mode: EmbeddingMode) -> CoreResult<Vec<Vec<f32>>> {
        Err(CoreError::NotSupported(
            "Anthropic does not provide an embedding API".to_string(),
        ))
    }

    fn supports_embeddings(&self) -> bool {
        false
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
