//! AI Provider Implementations
//!
//! Concrete implementations of the AiProvider trait for various AI services.

mod anthropic;
mod gemini;
mod ollama;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use serde::{Deserialize, Serialize};

// =============================================================================
// Provider Configuration
// =============================================================================

/// Supported AI provider kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI GPT models
    OpenAi,
    /// Anthropic Claude models
    Anthropic,
    /// Google Gemini models
    Gemini,
    /// Local models via Ollama
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "ollama" | "local" => Ok(ProviderKind::Ollama),
            _ => Err(format!("Unknown provider kind: {}", s)),
        }
    }
}

/// Configuration for creating a provider
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider kind
    pub kind: ProviderKind,
    /// API key (for cloud providers)
    pub api_key: Option<String>,
    /// Base URL (for custom endpoints or local models)
    pub base_url: Option<String>,
    /// Default chat model to use
    pub model: Option<String>,
    /// Embedding model to use (providers that support embeddings)
    pub embedding_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    /// Creates a new OpenAI provider config
    pub fn openai(api_key: &str) -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            api_key: Some(api_key.to_string()),
            base_url: None,
            model: Some("gpt-4o-mini".to_string()),
            embedding_model: Some("text-embedding-3-small".to_string()),
            timeout_secs: Some(60),
        }
    }

    /// Creates a new Anthropic provider config
    pub fn anthropic(api_key: &str) -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            api_key: Some(api_key.to_string()),
            base_url: None,
            model: Some("claude-sonnet-4-5-20250929".to_string()),
            embedding_model: None,
            timeout_secs: Some(60),
        }
    }

    /// Creates a new Google Gemini provider config
    pub fn gemini(api_key: &str) -> Self {
        Self {
            kind: ProviderKind::Gemini,
            api_key: Some(api_key.to_string()),
            base_url: None,
            model: Some("gemini-2.5-flash".to_string()),
            embedding_model: Some("text-embedding-004".to_string()),
            timeout_secs: Some(120), // Longer timeout for large context
        }
    }

    /// Creates a new local (Ollama) provider config
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self {
            kind: ProviderKind::Ollama,
            api_key: None,
            base_url: base_url.map(|s| s.to_string()),
            model: Some("llama3.2".to_string()),
            embedding_model: Some("nomic-embed-text".to_string()),
            timeout_secs: Some(120),
        }
    }

    /// Sets the chat model
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// Sets the embedding model
    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.embedding_model = Some(model.to_string());
        self
    }

    /// Sets the base URL
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = Some(url.to_string());
        self
    }
}

// =============================================================================
// Provider Factory
// =============================================================================

use super::provider::AiProvider;
use crate::core::CoreResult;

/// Creates an AI provider from configuration
pub fn create_provider(config: ProviderConfig) -> CoreResult<Box<dyn AiProvider>> {
    match config.kind {
        ProviderKind::OpenAi => {
            let provider = OpenAiProvider::new(config)?;
            Ok(Box::new(provider))
        }
        ProviderKind::Anthropic => {
            let provider = AnthropicProvider::new(config)?;
            Ok(Box::new(provider))
        }
        ProviderKind::Gemini => {
            let provider = GeminiProvider::new(config)?;
            Ok(Box::new(provider))
        }
        ProviderKind::Ollama => {
            let provider = OllamaProvider::new(config)?;
            Ok(Box::new(provider))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!(
            "openai".parse::<ProviderKind>().unwrap(),
            ProviderKind::OpenAi
        );
        assert_eq!(
            "anthropic".parse::<ProviderKind>().unwrap(),
            ProviderKind::Anthropic
        );
        assert_eq!(
            "gemini".parse::<ProviderKind>().unwrap(),
            ProviderKind::Gemini
        );
        assert_eq!(
            "ollama".parse::<ProviderKind>().unwrap(),
            ProviderKind::Ollama
        );
        assert_eq!(
            "local".parse::<ProviderKind>().unwrap(),
            ProviderKind::Ollama
        );
        assert!("unknown".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
        assert_eq!(ProviderKind::Anthropic.to_string(), "anthropic");
        assert_eq!(ProviderKind::Gemini.to_string(), "gemini");
        assert_eq!(ProviderKind::Ollama.to_string(), "ollama");
    }

    #[test]
    fn test_provider_config_openai() {
        let config = ProviderConfig::openai("test-key").with_model("gpt-4.1");
        assert_eq!(config.kind, ProviderKind::OpenAi);
        assert_eq!(config.api_key, Some("test-key".to_string()));
        assert_eq!(config.model, Some("gpt-4.1".to_string()));
        assert!(config.embedding_model.is_some());
    }

    #[test]
    fn test_provider_config_anthropic() {
        let config = ProviderConfig::anthropic("test-key");
        assert_eq!(config.kind, ProviderKind::Anthropic);
        assert!(config.embedding_model.is_none());
    }

    #[test]
    fn test_provider_config_ollama() {
        let config = ProviderConfig::ollama(Some("http://localhost:11434"));
        assert_eq!(config.kind, ProviderKind::Ollama);
        assert!(config.api_key.is_none());
        assert_eq!(config.base_url, Some("http://localhost:11434".to_string()));
    }
}
