//! AI Module
//!
//! Provider abstraction and failover pool for chat-completion and
//! embedding capabilities.

pub mod pool;
pub mod provider;
pub mod providers;

pub use pool::{PoolConfig, ProviderPool};
pub use provider::{
    AiProvider, ChatMessage, CompletionRequest, CompletionResponse, EmbeddingMode, FinishReason,
    MockFailure, MockProvider, TokenUsage,
};
pub use providers::{
    create_provider, AnthropicProvider, GeminiProvider, OllamaProvider, OpenAiProvider,
    ProviderConfig, ProviderKind,
};
