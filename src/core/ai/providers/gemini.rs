//! Google Gemini Provider Implementation
//!
//! Implements the AiProvider trait for Google's Gemini models. The
//! embedding endpoint carries a task type so query and document
//! embeddings land in compatible spaces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ProviderConfig;
use crate::core::ai::provider::{
    AiProvider, CompletionRequest, CompletionResponse, EmbeddingMode, FinishReason, TokenUsage,
};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Gemini Provider
// =============================================================================

/// Google Gemini API provider
pub struct GeminiProvider {
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

impl GeminiProvider {
    /// Default Gemini API base URL
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    /// Creates a new Gemini provider
    pub fn new(config: ProviderConfig) -> CoreResult<Self> {
        let api_key = config
            .api_key
            .ok_or_else(|| CoreError::ValidationError("Gemini API key is required".to_string()))?;

        if api_key.is_empty() {
            return Err(CoreError::ValidationError(
                "Gemini API key cannot be empty".to_string(),
            ));
        }

        let base_url = config
            .base_url
            .unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string());

        let default_model = config
            .model
            .unwrap_or_else(|| "gemini-2.5-flash".to_string());
        let embedding_model = config
            .embedding_model
            .unwrap_or_else(|| "text-embedding-004".to_string());
        let timeout_secs = config.timeout_secs.unwrap_or(120); // Longer timeout for large context

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

    fn build_generate_content_request(
        &self,
        request: &CompletionRequest,
    ) -> CoreResult<GenerateContentRequest> {
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(system) = &request.system {
            if !system.trim().is_empty() {
                system_parts.push(system.clone());
            }
        }

        let mut contents: Vec<Content> = Vec::new();
        for msg in &request.messages {
            let role = msg.role.to_ascii_lowercase();
            if role == "system" {
                if !msg.content.trim().is_empty() {
                    system_parts.push(msg.content.clone());
                }
                continue;
            }

            let gemini_role = match role.as_str() {
                "assistant" | "model" => "model",
                "user" => "user",
                _ => {
                    tracing::warn!(
                        "Unknown conversation role for Gemini provider: {} (defaulting to user)",
                        msg.role
                    );
                    "user"
                }
            };

            contents.push(Content {
                role: Some(gemini_role.to_string()),
                parts: vec![Part {
                    text: msg.content.clone(),
                }],
            });
        }

        if contents.is_empty() {
            return Err(CoreError::ValidationError(
                "Request must include at least one non-system message".to_string(),
            ));
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(Content {
                role: None, // System instruction doesn't need a role
                parts: vec![Part {
                    text: system_parts.join("\n\n"),
                }],
            })
        };

        let generation_config = Some(GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
            response_mime_type: if request.json_mode {
                Some("application/json".to_string())
            } else {
                None
            },
        });

        Ok(GenerateContentRequest {
            contents,
            system_instruction,
            generation_config,
        })
    }

    fn api_error(status: reqwest::StatusCode, body: &str) -> CoreError {
        let error: ApiError = serde_json::from_str(body).unwrap_or(ApiError {
            error: ApiErrorDetail {
                message: body.to_string(),
                code: None,
                status: None,
            },
        });

        // Gemini reports quota exhaustion as 429 RESOURCE_EXHAUSTED
        // without a usable retry-after header.
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return CoreError::RateLimited {
                retry_after_secs: 60,
                message: format!("Gemini rate limit: {}", error.error.message),
            };
        }

        let status_str = error.error.status.as_deref().unwrap_or("unknown");
        CoreError::AiRequestFailed(format!(
            "Gemini API error ({}; status={}): {}",
            status, status_str, error.error.message
        ))
    }
}

// =============================================================================
// Gemini API Types
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[allow(dead_code)]
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest {
    model: String,
    content: Content,
    task_type: String,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

// =============================================================================
// AiProvider Implementation
// =============================================================================

#[async_trait]
impl AiProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let model = request
            .model
            .as_deref()
            .unwrap_or(self.default_model.as_str())
            .to_string();

        let api_request = self.build_generate_content_request(&request)?;

        // API key is passed via header to avoid leaking it in logs.
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
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
            return Err(Self::api_error(status, &body));
        }

        let api_response: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::AiRequestFailed(format!("Failed to parse response: {}", e)))?;

        // Check for blocked content
        if let Some(feedback) = &api_response.prompt_feedback {
            if let Some(reason) = &feedback.block_reason {
                return Err(CoreError::AiRequestFailed(format!(
                    "Content blocked by Gemini safety filters: {}",
                    reason
                )));
            }
        }

        let candidates = api_response.candidates.ok_or_else(|| {
            CoreError::AiRequestFailed("No candidates returned from Gemini".to_string())
        })?;

        let candidate = candidates.first().ok_or_else(|| {
            CoreError::AiRequestFailed("Empty candidates array from Gemini".to_string())
        })?;

        let text = candidate
            .content
            .as_ref()
            .and_then(|c| c.parts.first())
            .map(|p| p.text.clone())
            .unwrap_or_default();

        let finish_reason = match candidate.finish_reason.as_deref() {
            Some("STOP") => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") | Some("OTHER") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        let usage = api_response
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                completion_tokens: u.candidates_token_count.unwrap_or(0),
                total_tokens: u.total_token_count.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text,
            model,
            usage,
            finish_reason,
        })
    }

    async fn embed(&self, texts: Vec<String>, mode: EmbeddingMode) -> CoreResult<Vec<Vec<f32>>> {
        let task_type = match mode {
            EmbeddingMode::Query => "RETRIEVAL_QUERY",
            EmbeddingMode::Document => "RETRIEVAL_DOCUMENT",
        };

        let url = format!(
            "{}/models/{}:embedContent",
            self.base_url, self.embedding_model
        );

        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            let api_request = EmbedContentRequest {
                model: format!("models/{}", self.embedding_model),
                content: Content {
                    role: None,
                    parts: vec![Part { text }],
                },
                task_type: task_type.to_string(),
            };

            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .header("Content-Type", "application/json")
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
                return Err(Self::api_error(status, &body));
            }

            let api_response: EmbedContentResponse = serde_json::from_str(&body).map_err(|e| {
                CoreError::AiRequestFailed(format!("Failed to parse embedding response: {}", e))
            })?;

            embeddings.push(api_response.embedding.values);
        }

        Ok(embeddings)
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
