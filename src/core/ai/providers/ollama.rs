//! Ollama Provider Implementation
//!
//! Implements the AiProvider trait for local models via Ollama.
//! Streaming uses Ollama's NDJSON chat stream; embeddings go through
//! the per-prompt /api/embeddings endpoint.

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
// Ollama Provider
// =============================================================================

/// Local AI provider using Ollama for running local models
pub struct OllamaProvider {
    /// Base URL for Ollama API
    base_url: String,
    /// Default chat model
    default_model: String,
    /// Embedding model
    embedding_model: String,
    /// HTTP client
    client: reqwest::Client,
}

impl OllamaProvider {
    /// Default Ollama API base URL
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    /// Creates a new Ollama provider
    pub fn new(config: ProviderConfig) -> CoreResult<Self> {
        let base_url = config
            .base_url
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());

        let default_model = config.model.unwrap_or_else(|| "llama3.2".to_string());
        let embedding_model = config
            .embedding_model
            .unwrap_or_else(|| "nomic-embed-text".to_string());
        let timeout_secs = config.timeout_secs.unwrap_or(120);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            default_model,
            embedding_model,
            client,
        })
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
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

        let options = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            })
        } else {
            None
        };

        ChatRequest {
            model,
            messages,
            stream,
            options,
            format: if request.json_mode {
                Some("json".to_string())
            } else {
                None
            },
        }
    }
}

// =============================================================================
// Ollama API Types
// =============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
    model: String,
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

// =============================================================================
// AiProvider Implementation
// =============================================================================

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let api_request = self.build_request(&request, false);

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(CoreError::AiRequestFailed(format!(
                "Ollama API error ({}): {}",
                status, body
            )));
        }

        let api_response: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to parse response: {}", e)))?;

        let usage = TokenUsage::new(
            api_response.prompt_eval_count.unwrap_or(0),
            api_response.eval_count.unwrap_or(0),
        );

        Ok(CompletionResponse {
            text: api_response.message.content,
            model: api_response.model,
            usage,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> CoreResult<CompletionResponse> {
        let api_request = self.build_request(&request, true);
        let model = api_request.model.clone();

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| CoreError::AiRequestFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::AiRequestFailed(format!(
                "Ollama API error ({}): {}",
                status, body
            )));
        }

        // Ollama streams one JSON object per line.
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();
        let mut usage = TokenUsage::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| CoreError::AiRequestFailed(format!("Stream read failed: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }

                let parsed: ChatResponse = serde_json::from_str(&line).map_err(|e| {
                    CoreError::AiRequestFailed(format!("Failed to parse stream chunk: {}", e))
                })?;

                if !parsed.message.content.is_empty() {
                    text.push_str(&parsed.message.content);
                    let _ = tokens.send(parsed.message.content);
                }
                if parsed.done {
                    usage = TokenUsage::new(
                        parsed.prompt_eval_count.unwrap_or(0),
                        parsed.eval_count.unwrap_or(0),
                    );
                }
            }
        }

        Ok(CompletionResponse {
            text,
            model,
            usage,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn embed(&self, texts: Vec<String>, _mode: EmbeddingMode) -> CoreResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let mut embeddings = Vec::with_capacity(texts.len());

        for text in texts {
            let api_request = EmbeddingRequest {
                model: self.embedding_model.clone(),
                prompt: text,
            };

            let response = self
                .client
                .post(&url)
                .json(&api_request)
                .send()
                .await
                .map_err(|e| {
                    CoreError::AiRequestFailed(format!("Embedding request failed: {}", e))
                })?;

            let status = response.status();
            let body = response.text().await.map_err(|e| {
                CoreError::AiRequestFailed(format!("Failed to read response: {}", e))
            })?;

            if !status.is_success() {
                return Err(CoreError::AiRequestFailed(format!(
                    "Ollama embedding API error ({}): {}",
                    status, body
                )));
            }

            let api_response: EmbeddingResponse = serde_json::from_str(&body).map_err(|e| {
                CoreError::AiRequestFailed(format!("Failed to parse embedding response: {}", e))
            })?;

            embeddings.push(api_response.embedding);
        }

        Ok(embeddings)
    }

    fn is_available(&self) -> bool {
        // Local endpoint needs no API key; reachability is checked at
        // request time.
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_provider_creation() {
        let config = ProviderConfig::ollama(None);
        let provider = OllamaProvider::new(config).unwrap();

        assert_eq!(provider.name(), "ollama");
        assert!(provider.is_available());
        assert_eq!(provider.base_url, OllamaProvider::DEFAULT_BASE_URL);
    }

    #[test]
    fn test_ollama_custom_base_url() {
        let config = ProviderConfig::ollama(Some("http://192.168.1.10:11434"));
        let provider = OllamaProvider::new(config).unwrap();

        assert_eq!(provider.base_url, "http://192.168.1.10:11434");
    }

    #[test]
    fn test_json_mode_sets_format() {
        let config = ProviderConfig::ollama(None);
        let provider = OllamaProvider::new(config).unwrap();

        let request = CompletionRequest::new("Hello").with_json_mode();
        let api_request = provider.build_request(&request, false);

        assert_eq!(api_request.format, Some("json".to_string()));
    }
}
