//! AI Provider Module
//!
//! Defines the trait and types for AI providers.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Embedding Mode
// =============================================================================

/// How an embedding will be used.
///
/// Providers that distinguish retrieval-query from retrieval-document
/// embeddings (e.g. Gemini task types) honor this; others ignore it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Embedding a search query
    Query,
    /// Embedding document content for indexing
    #[default]
    Document,
}

// =============================================================================
// AI Provider Trait
// =============================================================================

/// Trait for AI providers (OpenAI, Anthropic, Gemini, local models, etc.)
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Returns the provider name
    fn name(&self) -> &str;

    /// Generates a completion from a prompt
    async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse>;

    /// Generates a completion, forwarding tokens on `tokens` as they arrive.
    ///
    /// The full concatenated text is also returned in the response, so
    /// callers never depend on the receiving side staying alive. The
    /// default implementation performs a non-streaming completion and
    /// forwards the whole text as a single token.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> CoreResult<CompletionResponse> {
        let response = self.complete(request).await?;
        let _ = tokens.send(response.text.clone());
        Ok(response)
    }

    /// Generates embeddings for text
    async fn embed(&self, texts: Vec<String>, mode: EmbeddingMode) -> CoreResult<Vec<Vec<f32>>>;

    /// Whether this provider offers an embedding endpoint
    fn supports_embeddings(&self) -> bool {
        true
    }

    /// Checks if the provider is configured and usable
    fn is_available(&self) -> bool;
}

// =============================================================================
// Conversation Message
// =============================================================================

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Role: user, assistant, or system
    pub role: String,
    /// Message content
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }

    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }
}

// =============================================================================
// Completion Request
// =============================================================================

/// Request for text completion
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// System prompt/instructions
    pub system: Option<String>,
    /// Conversation messages (at least one user message)
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Model to use (provider-specific)
    pub model: Option<String>,
    /// Whether to request a JSON response
    pub json_mode: bool,
}

impl CompletionRequest {
    /// Creates a single-turn completion request
    pub fn new(prompt: &str) -> Self {
        Self {
            system: None,
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: None,
            temperature: None,
            model: None,
            json_mode: false,
        }
    }

    /// Creates a request from full conversation history
    pub fn with_conversation(messages: Vec<ChatMessage>) -> Self {
        Self {
            system: None,
            messages,
            max_tokens: None,
            temperature: None,
            model: None,
            json_mode: false,
        }
    }

    /// Sets the system prompt
    pub fn with_system(mut self, system: &str) -> Self {
        self.system = Some(system.to_string());
        self
    }

    /// Sets the maximum tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the model
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Enables JSON mode
    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

// =============================================================================
// Completion Response
// =============================================================================

/// Response from text completion
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    /// Generated text
    pub text: String,
    /// Model used
    pub model: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Finish reason
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Creates a new completion response
    pub fn new(text: &str, model: &str) -> Self {
        Self {
            text: text.to_string(),
            model: model.to_string(),
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Stop,
        }
    }
}

// =============================================================================
// Token Usage
// =============================================================================

/// Token usage statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Creates a new token usage record
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }
}

// =============================================================================
// Finish Reason
// =============================================================================

/// Reason for completion finish
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal stop
    #[default]
    Stop,
    /// Reached max tokens
    Length,
    /// Content filter triggered
    ContentFilter,
    /// Function/tool call
    ToolCalls,
}

// =============================================================================
// Mock Provider (for testing)
// =============================================================================

/// Simulated failure mode for [`MockProvider`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MockFailure {
    /// Calls succeed
    #[default]
    None,
    /// Calls fail with a transient request error
    Transient,
    /// Calls fail with a rate-limit error
    RateLimited { retry_after_secs: u64 },
}

/// Mock AI provider for testing
pub struct MockProvider {
    name: String,
    response: String,
    available: bool,
    failure: MockFailure,
    embed_dim: usize,
    calls: AtomicUsize,
}

impl MockProvider {
    /// Creates a new mock provider
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response: "Mock response".to_string(),
            available: true,
            failure: MockFailure::None,
            embed_dim: 8,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sets the mock response
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Sets availability
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Makes every call fail in the given way
    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Sets the native embedding dimensionality
    pub fn with_embed_dim(mut self, dim: usize) -> Self {
        self.embed_dim = dim;
        self
    }

    /// Number of complete/embed calls this provider has served
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> CoreResult<()> {
        match self.failure {
            MockFailure::None => Ok(()),
            MockFailure::Transient => Err(CoreError::AiRequestFailed(format!(
                "{}: simulated transient failure",
                self.name
            ))),
            MockFailure::RateLimited { retry_after_secs } => Err(CoreError::RateLimited {
                retry_after_secs,
                message: format!("{}: simulated rate limit", self.name),
            }),
        }
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _request: CompletionRequest) -> CoreResult<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(CompletionResponse::new(&self.response, "mock-model"))
    }

    async fn embed(&self, texts: Vec<String>, _mode: EmbeddingMode) -> CoreResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(texts.iter().map(|_| vec![0.1; self.embed_dim]).collect())
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

// =============================================================================
// Tests
// =============================================================================
