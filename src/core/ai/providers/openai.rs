//! OpenAI Provider Implementation
//!
//! Implements the AiProvider trait for OpenAI's GPT models, including
//! SSE streaming completions and the embeddings endpoint.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ProviderConfig;
use crate::core::ai::provider::{
    AiProvider, CompletionRequest, CompletionResponse, EmbeddingMode, FinishReason, TokenUsage,
};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// OpenAI Provider
// =============================================================================

/// OpenAI API provider for GPT models
pub struct OpenAiProvider {
    /// API key
    api_key: String,
    /// Base URL for API requests
    base_url: String,
    /// Default chat model
    default_model: String,
    /// Embedding model
    embedding_model: String,
    /// HTTP client
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Default OpenAI API base URL
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Creates a new OpenAI provider
    pub fn new(config: ProviderConfig) -> CoreResult<Self> {
        let api_key = config
            .api_key
            .ok_or_else(|| CoreError::ValidationError("OpenAI API key is required".to_string()))?;

        if api_key.is_empty() {
            return Err(CoreError::ValidationError(
                "OpenAI API key cannot be empty".to_string(),
            ));
        }

        let base_url = config
            .base_url
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());

        let default_model = config.model.unwrap_or_else(|| "gpt-4o-mini".to_string());
        let embedding_model = config
            .embedding_model
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let timeout_secs = config.timeout_secs.unwrap_or(60);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            base_url,
            default_model,
            embedding_model,
            client,
        })
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> ChatCompletionRequest {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for msg in &request.messages {
            messages.push(ApiMessage {
                role: msg.role.clone(),
                content: msg.content.clone(),
            });
        }

        ChatCompletionRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: if request.json_mode {
                Some(ResponseFormat {
                    format_type: "json_object".to_string(),
                })
            } else {
                None
            },
            stream,
        }
    }

    /// Maps a non-success response to a typed error, distinguishing
    /// rate limits so callers can cool this provider down.
    fn api_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> CoreError {
        let error: ApiError = serde_json::from_str(body).unwrap_or(ApiError {
            error: ApiErrorDetail {
                message: body.to_string(),
                error_type: None,
            },
        });

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return CoreError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(60),
                message: format!("OpenAI rate limit: {}", error.error.message),
            };
        }

        let error_type = error.error.error_type.as_deref().unwrap_or("unknown");
        CoreError::AiRequestFailed(format!(
            "OpenAI API error ({}; type={}): {}",
            status, error_type, error.error.message
        ))
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

// =============================================================================
// OpenAI API Types
// =============================================================================

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    model: String,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
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

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

// =============================================================================
// AiProvider Implementation
// =============================================================================

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let api_request = self.build_request(&request, false);

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        let retry_after = retry_after_secs(&response);
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Self::api_error(status, retry_after, &body));
        }

        let api_response: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to parse response: {}", e)))?;

        let choice = api_response.choices.first().ok_or_else(|| {
            CoreError::AiRequestFailed("No completion choices returned".to_string())
        })?;

        let text = choice.message.content.clone().unwrap_or_default();
        let finish_reason = map_finish_reason(choice.finish_reason.as_deref());

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text,
            model: api_response.model,
            usage,
            finish_reason,
        })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> CoreResult<CompletionResponse> {
        let api_request = self.build_request(&request, true);
        let model = api_request.model.clone();

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(Self::api_error(status, retry_after, &body));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut response_model = model;
        let mut finish_reason = FinishReason::Stop;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| CoreError::AiRequestFailed(format!("Stream read failed: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are newline-delimited; keep the trailing
            // partial line in the buffer for the next chunk.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }

                let parsed: StreamChunk = serde_json::from_str(data).map_err(|e| {
                    CoreError::AiRequestFailed(format!("Failed to parse stream chunk: {}", e))
                })?;

                if let Some(m) = parsed.model {
                    response_model = m;
                }
                if let Some(choice) = parsed.choices.first() {
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            text.push_str(content);
                            let _ = tokens.send(content.clone());
                        }
                    }
                    if choice.finish_reason.is_some() {
                        finish_reason = map_finish_reason(choice.finish_reason.as_deref());
                    }
                }
            }
        }

        Ok(CompletionResponse {
            text,
            model: response_model,
            usage: TokenUsage::default(),
            finish_reason,
        })
    }

    async fn embed(&self, texts: Vec<String>, _mode: EmbeddingMode) -> CoreResult<Vec<Vec<f32>>> {
        let api_request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts,
        };

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Embedding request failed: {}", e)))?;

        let status = response.status();
        let retry_after = retry_after_secs(&response);
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Self::api_error(status, retry_after, &body));
        }

        let api_response: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
            CoreError::AiRequestFailed(format!("Failed to parse embedding response: {}", e))
        })?;

        Ok(api_response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_provider_creation() {
        let config = ProviderConfig::openai("test-api-key");
        let provider = OpenAiProvider::new(config).unwrap();

        assert_eq!(provider.name(), "openai");
        assert!(provider.is_available());
        assert!(provider.supports_embeddings());
    }

    #[test]
    fn test_openai_provider_empty_key() {
        let config = ProviderConfig::openai("");
        let result = OpenAiProvider::new(config);

        assert!(result.is_err());
    }

    #[test]
    fn test_openai_custom_base_url() {
        let config =
            ProviderConfig::openai("test-key").with_base_url("https://custom.openai.com/v1");
        let provider = OpenAiProvider::new(config).unwrap();

        assert_eq!(provider.base_url, "https://custom.openai.com/v1");
    }

    #[test]
    fn test_openai_custom_model() {
        let config = ProviderConfig::openai("test-key").with_model("gpt-4.1");
        let provider = OpenAiProvider::new(config).unwrap();

        assert_eq!(provider.default_model, "gpt-4.1");
    }

    #[test]
    fn test_rate_limit_error_mapping() {
        let error = OpenAiProvider::api_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(30),
            r#"{"error":{"message":"Rate limit reached","type":"rate_limit_error"}}"#,
        );

        match error {
            CoreError::RateLimited {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 30),
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_error_mapping() {
        let error = OpenAiProvider::api_error(
            reqwest::StatusCode::BAD_REQUEST,
            None,
            r#"{"error":{"message":"Invalid model","type":"invalid_request_error"}}"#,
        );

        assert!(matches!(error, CoreError::AiRequestFailed(_)));
    }
}
