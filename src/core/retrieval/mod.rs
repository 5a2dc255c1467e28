//! Retrieval Module
//!
//! Similarity search over indexed chunks: embeds the query, asks the
//! chunk store for its native vector search, and falls back to
//! in-process cosine similarity when the store has none. Hits are
//! grouped by parent document and re-ordered by ordinal so assembled
//! context reads coherently, then packed under a character budget
//! that only cuts at document boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::ai::{EmbeddingMode, ProviderPool};
use crate::core::indexing::{ChunkStore, ScoredChunk};
use crate::core::{CoreError, CoreResult, DocumentId};

// =============================================================================
// Configuration
// =============================================================================

/// Search parameters
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Minimum cosine similarity for a chunk to count as relevant
    pub similarity_threshold: f32,
    /// Maximum chunks returned by the search
    pub limit: usize,
    /// Character budget for assembled context
    pub context_char_budget: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            limit: 5,
            context_char_budget: 30_000,
        }
    }
}

/// Optional filters applied to the chunk set before scoring
#[derive(Clone, Debug, Default)]
pub struct SearchFilters {
    /// Restrict to one category
    pub category: Option<String>,
}

// =============================================================================
// Response Types
// =============================================================================

/// One source document contributing to the assembled context
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSource {
    pub document_id: DocumentId,
    pub title: String,
    /// Highest chunk similarity within this document
    pub similarity: f32,
}

/// Search result: assembled context plus ranked sources
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Concatenated context, bounded by the character budget
    pub context: String,
    /// Contributing documents, sorted by max similarity descending
    pub sources: Vec<SearchSource>,
}

// =============================================================================
// Cosine Similarity
// =============================================================================

/// Cosine similarity between two vectors; zero when either has no
/// magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// =============================================================================
// Retriever
// =============================================================================

/// Similarity search and context assembly over the chunk store
pub struct Retriever {
    store: Arc<dyn ChunkStore>,
    pool: Arc<ProviderPool>,
    config: SearchConfig,
}

impl Retriever {
    /// Creates a new retriever
    pub fn new(store: Arc<dyn ChunkStore>, pool: Arc<ProviderPool>, config: SearchConfig) -> Self {
        Self {
            store,
            pool,
            config,
        }
    }

    /// Searches the index for chunks relevant to a query and
    /// assembles bounded context from them.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        filters: &SearchFilters,
    ) -> CoreResult<SearchResponse> {
        let embeddings = self
            .pool
            .embed(vec![query.to_string()], EmbeddingMode::Query)
            .await?;
        let query_embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Internal("Empty embedding response".to_string()))?;

        let hits = self
            .find_similar_chunks(user_id, &query_embedding, filters)
            .await?;

        Ok(self.assemble_context(hits))
    }

    /// Native vector search when available, in-process cosine
    /// similarity otherwise.
    async fn find_similar_chunks(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        filters: &SearchFilters,
    ) -> CoreResult<Vec<ScoredChunk>> {
        let category = filters.category.as_deref();

        match self
            .store
            .native_search(
                query_embedding,
                self.config.similarity_threshold,
                self.config.limit,
                user_id,
                category,
            )
            .await
        {
            Ok(hits) => return Ok(hits),
            Err(CoreError::NotSupported(_)) => {
                debug!("No native vector search; using brute-force fallback");
            }
            Err(e) => return Err(e),
        }

        let chunks = self.store.fetch_chunks(user_id, category).await?;

        let mut scored: Vec<ScoredChunk> = chunks
            .into_iter()
            .map(|chunk| {
                let similarity = cosine_similarity(query_embedding, &chunk.embedding);
                ScoredChunk { chunk, similarity }
            })
            .filter(|s| s.similarity >= self.config.similarity_threshold)
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(self.config.limit);

        Ok(scored)
    }

    /// Groups hits by document, restores ordinal order within each
    /// document, and packs documents into the character budget in
    /// descending max-similarity order. A document that would breach
    /// the budget ends assembly; context is never cut mid-document.
    fn assemble_context(&self, hits: Vec<ScoredChunk>) -> SearchResponse {
        let mut groups: HashMap<DocumentId, (String, f32, Vec<ScoredChunk>)> = HashMap::new();
        for hit in hits {
            let entry = groups
                .entry(hit.chunk.document_id.clone())
                .or_insert_with(|| (hit.chunk.document_title.clone(), hit.similarity, Vec::new()));
            entry.1 = entry.1.max(hit.similarity);
            entry.2.push(hit);
        }

        let mut documents: Vec<(DocumentId, String, f32, Vec<ScoredChunk>)> = groups
            .into_iter()
            .map(|(id, (title, max_sim, chunks))| (id, title, max_sim, chunks))
            .collect();
        documents.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut context = String::new();
        let mut sources = Vec::new();

        for (document_id, title, max_sim, mut chunks) in documents {
            chunks.sort_by_key(|c| c.chunk.ordinal);
            let body = chunks
                .iter()
                .map(|c| c.chunk.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let block = format!("## {}\n\n{}", title, body);

            let needed = if context.is_empty() {
                block.chars().count()
            } else {
                block.chars().count() + 2
            };
            if context.chars().count() + needed > self.config.context_char_budget {
                break;
            }

            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&block);
            sources.push(SearchSource {
                document_id,
                title,
                similarity: max_sim,
            });
        }

        SearchResponse { context, sources }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ai::{
        AiProvider, CompletionRequest, CompletionResponse, MockProvider, PoolConfig,
    };
    use crate::core::indexing::IndexDb;
    use async_trait::async_trait;
    use chrono::Utc;
    use ulid::Ulid;

    /// Embedding provider returning one fixed vector for every text
    struct FixedEmbed(Vec<f32>);

    #[async_trait]
    impl AiProvider for FixedEmbed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, _request: CompletionRequest) -> CoreResult<CompletionResponse> {
            Ok(CompletionResponse::new("unused", "fixed"))
        }

        async fn embed(
            &self,
            texts: Vec<String>,
            _mode: EmbeddingMode,
        ) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    fn pool_with_query_vector(vector: Vec<f32>) -> Arc<ProviderPool> {
        let dim = vector.len();
        Arc::new(ProviderPool::new(
            vec![Arc::new(FixedEmbed(vector)) as Arc<dyn AiProvider>],
            PoolConfig {
                max_attempts: 3,
                embedding_dim: dim,
                default_cooldown_secs: 60,
            },
        ))
    }

    fn seeded_db() -> Arc<IndexDb> {
        let db = IndexDb::in_memory().unwrap();

        let alpha = db
            .upsert_document(&crate::core::indexing::IndexedDocument {
                id: Ulid::new().to_string(),
                user_id: "user-1".to_string(),
                source_id: "alpha".to_string(),
                title: "Alpha".to_string(),
                category: Some("videos".to_string()),
                tags: Vec::new(),
                last_edited_at: Utc::now(),
                indexed_at: Utc::now(),
            })
            .unwrap();
        let beta = db
            .upsert_document(&crate::core::indexing::IndexedDocument {
                id: Ulid::new().to_string(),
                user_id: "user-1".to_string(),
                source_id: "beta".to_string(),
                title: "Beta".to_string(),
                category: Some("articles".to_string()),
                tags: Vec::new(),
                last_edited_at: Utc::now(),
                indexed_at: Utc::now(),
            })
            .unwrap();

        // Alpha's chunks point along the x axis; ordinal order is
        // deliberately shuffled relative to similarity.
        db.replace_chunks(
            &alpha,
            &[
                (Ulid::new().to_string(), "alpha first".to_string(), 3, vec![0.9, 0.1]),
                (Ulid::new().to_string(), "alpha second".to_string(), 3, vec![1.0, 0.0]),
            ],
        )
        .unwrap();
        // Beta's chunk is orthogonal to the query.
        db.replace_chunks(
            &beta,
            &[(Ulid::new().to_string(), "beta only".to_string(), 2, vec![0.0, 1.0])],
        )
        .unwrap();

        Arc::new(db)
    }

    #[tokio::test]
    async fn test_search_filters_by_threshold() {
        let db = seeded_db();
        let retriever = Retriever::new(
            db,
            pool_with_query_vector(vec![1.0, 0.0]),
            SearchConfig::default(),
        );

        let response = retriever
            .search("user-1", "anything", &SearchFilters::default())
            .await
            .unwrap();

        // Beta is orthogonal to the query and stays out.
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].title, "Alpha");
        assert!(response.sources[0].similarity > 0.9);
        assert!(!response.context.contains("beta only"));
    }

    #[tokio::test]
    async fn test_chunks_reordered_by_ordinal() {
        let db = seeded_db();
        let retriever = Retriever::new(
            db,
            pool_with_query_vector(vec![1.0, 0.0]),
            SearchConfig::default(),
        );

        let response = retriever
            .search("user-1", "anything", &SearchFilters::default())
            .await
            .unwrap();

        // "alpha second" has the higher similarity but the lower
        // ordinal comes first in assembled context.
        let first = response.context.find("alpha first").unwrap();
        let second = response.context.find("alpha second").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_category_filter_restricts_results() {
        let db = seeded_db();
        let retriever = Retriever::new(
            db,
            pool_with_query_vector(vec![1.0, 0.0]),
            SearchConfig::default(),
        );

        let filters = SearchFilters {
            category: Some("articles".to_string()),
        };
        let response = retriever.search("user-1", "anything", &filters).await.unwrap();

        // Only Beta is in "articles", and it scores below threshold.
        assert!(response.sources.is_empty());
        assert!(response.context.is_empty());
    }

    #[tokio::test]
    async fn test_user_scoping() {
        let db = seeded_db();
        let retriever = Retriever::new(
            db,
            pool_with_query_vector(vec![1.0, 0.0]),
            SearchConfig::default(),
        );

        let response = retriever
            .search("user-2", "anything", &SearchFilters::default())
            .await
            .unwrap();

        assert!(response.sources.is_empty());
    }

    #[tokio::test]
    async fn test_context_budget_cuts_at_document_boundary() {
        let db = IndexDb::in_memory().unwrap();
        for (source_id, vector) in [("close", vec![1.0, 0.0]), ("further", vec![0.8, 0.2])] {
            let id = db
                .upsert_document(&crate::core::indexing::IndexedDocument {
                    id: Ulid::new().to_string(),
                    user_id: "user-1".to_string(),
                    source_id: source_id.to_string(),
                    title: source_id.to_string(),
                    category: None,
                    tags: Vec::new(),
                    last_edited_at: Utc::now(),
                    indexed_at: Utc::now(),
                })
                .unwrap();
            db.replace_chunks(
                &id,
                &[(
                    Ulid::new().to_string(),
                    format!("{} {}", source_id, "content ".repeat(20)),
                    50,
                    vector,
                )],
            )
            .unwrap();
        }

        let config = SearchConfig {
            similarity_threshold: 0.5,
            limit: 5,
            // Enough for one document block, not two.
            context_char_budget: 220,
        };
        let retriever = Retriever::new(Arc::new(db), pool_with_query_vector(vec![1.0, 0.0]), config);

        let response = retriever
            .search("user-1", "anything", &SearchFilters::default())
            .await
            .unwrap();

        // The higher-similarity document fits; the second would breach
        // the budget and is dropped whole.
        assert_eq!(response.sources.len(), 1);
        assert_eq!(response.sources[0].title, "close");
        assert!(response.context.chars().count() <= 220);
        assert!(!response.context.contains("further"));
    }

    #[tokio::test]
    async fn test_limit_caps_scored_chunks() {
        let db = IndexDb::in_memory().unwrap();
        let id = db
            .upsert_document(&crate::core::indexing::IndexedDocument {
                id: Ulid::new().to_string(),
                user_id: "user-1".to_string(),
                source_id: "doc".to_string(),
                title: "Doc".to_string(),
                category: None,
                tags: Vec::new(),
                last_edited_at: Utc::now(),
                indexed_at: Utc::now(),
            })
            .unwrap();

        let chunks: Vec<(String, String, u32, Vec<f32>)> = (0..10)
            .map(|i| {
                (
                    Ulid::new().to_string(),
                    format!("chunk {}", i),
                    2,
                    vec![1.0, 0.0],
                )
            })
            .collect();
        db.replace_chunks(&id, &chunks).unwrap();

        let config = SearchConfig {
            limit: 3,
            ..SearchConfig::default()
        };
        let retriever = Retriever::new(Arc::new(db), pool_with_query_vector(vec![1.0, 0.0]), config);

        let response = retriever
            .search("user-1", "anything", &SearchFilters::default())
            .await
            .unwrap();

        // 3 of the 10 identical-similarity chunks survive the limit.
        let chunk_count = response.context.matches("chunk ").count();
        assert_eq!(chunk_count, 3);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_mock_pool_round_trip() {
        // Sanity check that the stock mock pool works end to end.
        let db = IndexDb::in_memory().unwrap();
        let pool = Arc::new(ProviderPool::new(
            vec![Arc::new(MockProvider::new("mock").with_embed_dim(4)) as Arc<dyn AiProvider>],
            PoolConfig {
                max_attempts: 3,
                embedding_dim: 4,
                default_cooldown_secs: 60,
            },
        ));
        let retriever = Retriever::new(Arc::new(db), pool, SearchConfig::default());

        let response = retriever
            .search("user-1", "anything", &SearchFilters::default())
            .await
            .unwrap();
        assert!(response.sources.is_empty());
    }
}
