//! Provider Pool
//!
//! Failover pool over the configured AI providers. Chat and embedding
//! requests rotate through the eligible providers round-robin, skip
//! providers cooling down after a rate limit or sidelined after a
//! hard failure, and fail open by clearing every mark rather than
//! refusing to serve when the whole roster is down.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::provider::{AiProvider, CompletionRequest, CompletionResponse, EmbeddingMode};
use super::providers::{create_provider, ProviderConfig};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Pool Configuration
// =============================================================================

/// Configuration for the provider pool
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum providers tried per request
    pub max_attempts: usize,
    /// Dimensionality every embedding is normalized to
    pub embedding_dim: usize,
    /// Cooldown applied after a rate limit without a retry-after hint
    pub default_cooldown_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            embedding_dim: 1536,
            default_cooldown_secs: 60,
        }
    }
}

// =============================================================================
// Provider Pool
// =============================================================================

/// Availability of a single provider within the rotation
#[derive(Clone, Copy, Debug)]
enum ProviderHealth {
    Healthy,
    /// Rate limited; rejoins once the deadline passes
    CoolingUntil(Instant),
    /// Hard failure; rejoins only through a fail-open reset
    Failed,
}

struct PoolState {
    /// Per-provider availability, indexed like `providers`
    health: Vec<ProviderHealth>,
    /// Rotating cursor over the chat roster
    chat_cursor: usize,
    /// Rotating cursor over the embedding roster
    embed_cursor: usize,
}

/// Failover pool over AI providers
pub struct ProviderPool {
    providers: Vec<Arc<dyn AiProvider>>,
    /// Indices of providers eligible for chat completions
    chat_roster: Vec<usize>,
    /// Indices of providers eligible for embeddings
    embed_roster: Vec<usize>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ProviderPool {
    /// Creates a pool over the given providers
    pub fn new(providers: Vec<Arc<dyn AiProvider>>, config: PoolConfig) -> Self {
        let chat_roster: Vec<usize> = providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_available())
            .map(|(i, _)| i)
            .collect();

        let embed_roster: Vec<usize> = providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_available() && p.supports_embeddings())
            .map(|(i, _)| i)
            .collect();

        let health = vec![ProviderHealth::Healthy; providers.len()];

        Self {
            providers,
            chat_roster,
            embed_roster,
            config,
            state: Mutex::new(PoolState {
                health,
                chat_cursor: 0,
                embed_cursor: 0,
            }),
        }
    }

    /// Builds a pool from provider configurations
    pub fn from_configs(configs: Vec<ProviderConfig>, pool_config: PoolConfig) -> CoreResult<Self> {
        let mut providers: Vec<Arc<dyn AiProvider>> = Vec::with_capacity(configs.len());
        for config in configs {
            providers.push(Arc::from(create_provider(config)?));
        }
        Ok(Self::new(providers, pool_config))
    }

    /// Builds a pool from environment variables.
    ///
    /// Recognized: `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`,
    /// `GEMINI_API_KEY`, `OLLAMA_BASE_URL`. Providers appear in the
    /// rotation in that order.
    pub fn from_env(pool_config: PoolConfig) -> CoreResult<Self> {
        let mut configs = Vec::new();

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                configs.push(ProviderConfig::openai(&key));
            }
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            if !key.is_empty() {
                configs.push(ProviderConfig::anthropic(&key));
            }
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                configs.push(ProviderConfig::gemini(&key));
            }
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            if !url.is_empty() {
                configs.push(ProviderConfig::ollama(Some(&url)));
            }
        }

        Self::from_configs(configs, pool_config)
    }

    /// Whether at least one chat-capable provider is configured
    pub fn chat_ready(&self) -> bool {
        !self.chat_roster.is_empty()
    }

    /// Whether at least one embedding-capable provider is configured
    pub fn embedding_ready(&self) -> bool {
        !self.embed_roster.is_empty()
    }

    /// Names of configured providers, in rotation order
    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Picks the next eligible provider index from a roster, skipping
    /// providers cooling down or sidelined by a hard failure. When no
    /// roster member is eligible, every mark is cleared and rotation
    /// resumes rather than refusing the request.
    fn next_provider(&self, roster: &[usize], embed: bool) -> CoreResult<usize> {
        if roster.is_empty() {
            return Err(CoreError::NotReady(
                "No providers configured for this capability".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let cursor = if embed {
            state.embed_cursor
        } else {
            state.chat_cursor
        };

        for offset in 0..roster.len() {
            let pos = (cursor + offset) % roster.len();
            let idx = roster[pos];
            let eligible = match state.health[idx] {
                ProviderHealth::Healthy => true,
                ProviderHealth::CoolingUntil(until) => until <= now,
                ProviderHealth::Failed => false,
            };
            if eligible {
                state.health[idx] = ProviderHealth::Healthy;
                let next = (pos + 1) % roster.len();
                if embed {
                    state.embed_cursor = next;
                } else {
                    state.chat_cursor = next;
                }
                return Ok(idx);
            }
        }

        // Fail open: a marked-down roster must never wedge the pool.
        warn!("All providers marked down; clearing marks and retrying");
        for idx in roster {
            state.health[*idx] = ProviderHealth::Healthy;
        }
        let pos = cursor % roster.len();
        let next = (pos + 1) % roster.len();
        if embed {
            state.embed_cursor = next;
        } else {
            state.chat_cursor = next;
        }
        Ok(roster[pos])
    }

    /// Records a failure against a provider. Rate limits honor the
    /// server's retry hint and expire on their own; any other failure
    /// sidelines the provider until a fail-open reset.
    fn mark_failed(&self, idx: usize, error: &CoreError) {
        let mut state = self.state.lock().unwrap();
        state.health[idx] = match error {
            CoreError::RateLimited {
                retry_after_secs, ..
            } => {
                let secs = if *retry_after_secs > 0 {
                    *retry_after_secs
                } else {
                    self.config.default_cooldown_secs
                };
                ProviderHealth::CoolingUntil(Instant::now() + Duration::from_secs(secs))
            }
            _ => ProviderHealth::Failed,
        };
    }

    /// Generates a completion, failing over across providers
    pub async fn complete(&self, request: CompletionRequest) -> CoreResult<CompletionResponse> {
        let mut last_error: Option<CoreError> = None;
        let attempts = self.config.max_attempts;

        for attempt in 0..attempts {
            let idx = self.next_provider(&self.chat_roster, false)?;
            let provider = &self.providers[idx];

            debug!(
                provider = provider.name(),
                attempt = attempt + 1,
                "Attempting completion"
            );

            match provider.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Completion failed");
                    self.mark_failed(idx, &e);
                    last_error = Some(e);
                }
            }
        }

        Err(CoreError::ProvidersExhausted {
            attempts: attempts as u32,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers available".to_string()),
        })
    }

    /// Generates a streaming completion, failing over across providers.
    ///
    /// Failover only happens before the first token: once a provider
    /// starts streaming, its error is surfaced rather than restarting
    /// the stream on another provider mid-output.
    pub async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tokens: mpsc::UnboundedSender<String>,
    ) -> CoreResult<CompletionResponse> {
        let mut last_error: Option<CoreError> = None;
        let attempts = self.config.max_attempts;

        for attempt in 0..attempts {
            let idx = self.next_provider(&self.chat_roster, false)?;
            let provider = &self.providers[idx];

            debug!(
                provider = provider.name(),
                attempt = attempt + 1,
                "Attempting streaming completion"
            );

            // Forward through a per-attempt channel so a mid-stream
            // failure can be told apart from one before any token.
            let (attempt_tx, mut attempt_rx) = mpsc::unbounded_channel::<String>();
            let downstream = tokens.clone();
            let forwarder = tokio::spawn(async move {
                let mut sent = false;
                while let Some(token) = attempt_rx.recv().await {
                    sent = true;
                    let _ = downstream.send(token);
                }
                sent
            });

            let result = provider.complete_streaming(request.clone(), attempt_tx).await;
            let streamed = forwarder.await.unwrap_or(false);

            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Streaming completion failed");
                    self.mark_failed(idx, &e);
                    if streamed {
                        // The caller already saw part of this stream;
                        // another provider would replay the output.
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(CoreError::ProvidersExhausted {
            attempts: attempts as u32,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers available".to_string()),
        })
    }

    /// Generates embeddings, failing over across embedding-capable
    /// providers. Every vector is normalized to the configured
    /// dimensionality so rows from different vendors stay comparable.
    pub async fn embed(
        &self,
        texts: Vec<String>,
        mode: EmbeddingMode,
    ) -> CoreResult<Vec<Vec<f32>>> {
        let mut last_error: Option<CoreError> = None;
        let attempts = self.config.max_attempts;

        for attempt in 0..attempts {
            let idx = self.next_provider(&self.embed_roster, true)?;
            let provider = &self.providers[idx];

            debug!(
                provider = provider.name(),
                attempt = attempt + 1,
                count = texts.len(),
                "Attempting embedding"
            );

            match provider.embed(texts.clone(), mode).await {
                Ok(embeddings) => {
                    return Ok(embeddings
                        .into_iter()
                        .map(|v| self.normalize_dimension(v, provider.name()))
                        .collect());
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Embedding failed");
                    self.mark_failed(idx, &e);
                    last_error = Some(e);
                }
            }
        }

        Err(CoreError::ProvidersExhausted {
            attempts: attempts as u32,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers available".to_string()),
        })
    }

    /// Zero-pads or truncates a vector to the pool's embedding
    /// dimensionality.
    fn normalize_dimension(&self, mut vector: Vec<f32>, provider: &str) -> Vec<f32> {
        let target = self.config.embedding_dim;
        if vector.len() == target {
            return vector;
        }

        debug!(
            provider,
            actual = vector.len(),
            expected = target,
            "Normalizing embedding dimensionality"
        );
        vector.resize(target, 0.0);
        vector
    }
}

// =============================================================================
// Tests
// =============================================================================
