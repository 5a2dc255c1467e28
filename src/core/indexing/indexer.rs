//! Indexer Module
//!
//! Orchestrates chunking and embedding of source documents, diffing
//! against the previously indexed state, and batched full/incremental
//! re-indexing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::db::{IndexDb, IndexedDocument};
use crate::core::ai::{EmbeddingMode, ProviderPool};
use crate::core::chunker::{chunk_text, normalize_text, ChunkConfig};
use crate::core::content::{ContentSource, SourceDocument};
use crate::core::{CoreError, CoreResult, SourceId};

// =============================================================================
// Configuration
// =============================================================================

/// Indexer parameters
#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Documents with less normalized content than this are treated
    /// as noise: archived at the source and purged from the index
    pub min_content_chars: usize,
    /// Documents indexed concurrently per batch
    pub batch_size: usize,
    /// Chunking parameters
    pub chunk: ChunkConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            min_content_chars: 100,
            batch_size: 5,
            chunk: ChunkConfig::default(),
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of indexing a single document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexOutcome {
    /// Document was chunked and embedded
    Indexed {
        chunk_count: usize,
        category: Option<String>,
    },
    /// Document was too short; archived at the source and purged
    Deleted,
}

/// Aggregate result of a batch indexing pass
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    /// Documents successfully indexed
    pub indexed: usize,
    /// Documents purged (too short, or removed at the source)
    pub deleted: usize,
    /// Per-document failures, batch continued regardless
    pub errors: Vec<(SourceId, String)>,
}

/// Diff between the content source and the local index
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    /// Documents present at the source but not in the index
    pub new: Vec<SourceDocument>,
    /// Documents edited at the source since they were indexed
    pub modified: Vec<SourceDocument>,
    /// Indexed documents no longer present at the source
    pub deleted: Vec<SourceId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

// =============================================================================
// Indexer
// =============================================================================

/// Chunks, embeds, and stores source documents
pub struct Indexer {
    db: Arc<IndexDb>,
    pool: Arc<ProviderPool>,
    source: Arc<dyn ContentSource>,
    config: IndexerConfig,
}

impl Indexer {
    /// Creates a new indexer
    pub fn new(
        db: Arc<IndexDb>,
        pool: Arc<ProviderPool>,
        source: Arc<dyn ContentSource>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            db,
            pool,
            source,
            config,
        }
    }

    /// Indexes one document: chunk, embed in a single batched call,
    /// upsert the document row, and replace its chunk set.
    ///
    /// Documents below the minimum content length are archived at the
    /// source and purged locally rather than skipped, so a shrunken
    /// document cannot leave stale chunks behind.
    pub async fn index_document(
        &self,
        user_id: &str,
        doc: &SourceDocument,
    ) -> CoreResult<IndexOutcome> {
        let normalized = normalize_text(&doc.content);

        if normalized.chars().count() < self.config.min_content_chars {
            debug!(source_id = %doc.id, "Document below minimum length; purging");
            if let Err(e) = self.source.archive(&doc.id).await {
                warn!(source_id = %doc.id, error = %e, "Failed to archive short document");
            }
            self.db.delete_document(user_id, &doc.id)?;
            return Ok(IndexOutcome::Deleted);
        }

        let pieces = chunk_text(&normalized, &self.config.chunk);
        let texts: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();

        let embeddings = self.pool.embed(texts, EmbeddingMode::Document).await?;
        if embeddings.len() != pieces.len() {
            return Err(CoreError::Internal(format!(
                "Embedding count mismatch: {} chunks, {} vectors",
                pieces.len(),
                embeddings.len()
            )));
        }

        let category = doc.categories.first().cloned();
        let document_id = self.db.upsert_document(&IndexedDocument {
            id: Ulid::new().to_string(),
            user_id: user_id.to_string(),
            source_id: doc.id.clone(),
            title: doc.title.clone(),
            category: category.clone(),
            tags: doc.tags.clone(),
            last_edited_at: doc.last_edited_at,
            indexed_at: Utc::now(),
        })?;

        let chunk_rows: Vec<(String, String, u32, Vec<f32>)> = pieces
            .into_iter()
            .zip(embeddings)
            .map(|(piece, embedding)| {
                (
                    Ulid::new().to_string(),
                    piece.content,
                    piece.token_count as u32,
                    embedding,
                )
            })
            .collect();

        self.db.replace_chunks(&document_id, &chunk_rows)?;

        info!(
            source_id = %doc.id,
            chunks = chunk_rows.len(),
            "Indexed document"
        );

        Ok(IndexOutcome::Indexed {
            chunk_count: chunk_rows.len(),
            category,
        })
    }

    /// Diffs the current source listing against the index: absent
    /// documents are new, newer-edited documents are modified, and
    /// indexed documents missing from the listing are deleted.
    pub async fn detect_changes(&self, user_id: &str) -> CoreResult<ChangeSet> {
        let current = self.source.list_all_documents(None).await?;
        let indexed: HashMap<SourceId, DateTime<Utc>> =
            self.db.list_indexed(user_id)?.into_iter().collect();

        let mut changes = ChangeSet::default();
        for doc in &current {
            match indexed.get(&doc.id) {
                None => changes.new.push(doc.clone()),
                Some(indexed_at) if doc.last_edited_at > *indexed_at => {
                    changes.modified.push(doc.clone());
                }
                Some(_) => {}
            }
        }

        let current_ids: HashSet<&str> = current.iter().map(|d| d.id.as_str()).collect();
        for source_id in indexed.keys() {
            if !current_ids.contains(source_id.as_str()) {
                changes.deleted.push(source_id.clone());
            }
        }

        Ok(changes)
    }

    /// Indexes every source document in fixed-size concurrent batches
    /// with best-effort-per-item semantics.
    pub async fn index_all(&self, user_id: &str) -> CoreResult<IndexReport> {
        let documents = self.source.list_all_documents(None).await?;
        info!(count = documents.len(), "Starting full index pass");

        let mut report = IndexReport::default();
        self.index_batched(user_id, &documents, &mut report).await;
        Ok(report)
    }

    /// Indexes only the new and modified documents from the change
    /// diff, then purges the deleted ones.
    pub async fn index_incremental(&self, user_id: &str) -> CoreResult<IndexReport> {
        let changes = self.detect_changes(user_id).await?;
        info!(
            new = changes.new.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "Starting incremental index pass"
        );

        let mut report = IndexReport::default();

        let mut to_index = changes.new;
        to_index.extend(changes.modified);
        self.index_batched(user_id, &to_index, &mut report).await;

        for source_id in &changes.deleted {
            match self.db.delete_document(user_id, source_id) {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(e) => report.errors.push((source_id.clone(), e.to_string())),
            }
        }

        Ok(report)
    }

    async fn index_batched(
        &self,
        user_id: &str,
        documents: &[SourceDocument],
        report: &mut IndexReport,
    ) {
        for batch in documents.chunks(self.config.batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|doc| async move { (doc.id.clone(), self.index_document(user_id, doc).await) }),
            )
            .await;

            for (source_id, result) in results {
                match result {
                    Ok(IndexOutcome::Indexed { .. }) => report.indexed += 1,
                    Ok(IndexOutcome::Deleted) => report.deleted += 1,
                    Err(e) => {
                        warn!(source_id = %source_id, error = %e, "Failed to index document");
                        report.errors.push((source_id, e.to_string()));
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ai::{AiProvider, MockFailure, MockProvider, PoolConfig};
    use crate::core::content::InMemorySource;
    use chrono::Duration;

    fn test_pool() -> Arc<ProviderPool> {
        Arc::new(ProviderPool::new(
            vec![Arc::new(MockProvider::new("mock").with_embed_dim(8)) as Arc<dyn AiProvider>],
            PoolConfig {
                max_attempts: 3,
                embedding_dim: 8,
                default_cooldown_secs: 60,
            },
        ))
    }

    fn long_doc(id: &str, edited: DateTime<Utc>) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            title: format!("Doc {}", id),
            content: "A paragraph with enough words to pass the minimum length filter. "
                .repeat(5),
            categories: vec!["videos".to_string()],
            tags: vec!["rust".to_string()],
            last_edited_at: edited,
        }
    }

    fn indexer(source: Arc<InMemorySource>) -> (Indexer, Arc<IndexDb>) {
        let db = Arc::new(IndexDb::in_memory().unwrap());
        let indexer = Indexer::new(
            db.clone(),
            test_pool(),
            source,
            IndexerConfig::default(),
        );
        (indexer, db)
    }

    #[tokio::test]
    async fn test_index_document_stores_chunks() {
        let doc = long_doc("page-1", Utc::now());
        let source = Arc::new(InMemorySource::with_documents(vec![doc.clone()]));
        let (indexer, db) = indexer(source);

        let outcome = indexer.index_document("user-1", &doc).await.unwrap();

        match outcome {
            IndexOutcome::Indexed {
                chunk_count,
                category,
            } => {
                assert!(chunk_count > 0);
                assert_eq!(category, Some("videos".to_string()));
            }
            other => panic!("expected indexed outcome, got {:?}", other),
        }

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.document_count, 1);
        assert!(stats.chunk_count > 0);
    }

    #[tokio::test]
    async fn test_short_document_archived_and_purged() {
        let mut doc = long_doc("page-1", Utc::now());
        let source = Arc::new(InMemorySource::with_documents(vec![doc.clone()]));
        let (indexer, db) = indexer(source.clone());

        // Index normally, then shrink the document below the minimum.
        indexer.index_document("user-1", &doc).await.unwrap();
        assert_eq!(db.get_stats().unwrap().document_count, 1);

        doc.content = "tiny".to_string();
        let outcome = indexer.index_document("user-1", &doc).await.unwrap();

        assert_eq!(outcome, IndexOutcome::Deleted);
        assert_eq!(source.archived_ids(), vec!["page-1".to_string()]);
        assert_eq!(db.get_stats().unwrap().document_count, 0);
        assert_eq!(db.get_stats().unwrap().chunk_count, 0);
    }

    #[tokio::test]
    async fn test_reindex_upserts_single_row() {
        let doc = long_doc("page-1", Utc::now());
        let source = Arc::new(InMemorySource::with_documents(vec![doc.clone()]));
        let (indexer, db) = indexer(source);

        indexer.index_document("user-1", &doc).await.unwrap();
        indexer.index_document("user-1", &doc).await.unwrap();

        assert_eq!(db.get_stats().unwrap().document_count, 1);
    }

    #[tokio::test]
    async fn test_detect_changes_new_modified_deleted() {
        let t1 = Utc::now() - Duration::hours(2);
        let t2 = Utc::now() - Duration::hours(1);

        let doc_a = long_doc("a", t1);
        let doc_b = long_doc("b", t2);
        let source = Arc::new(InMemorySource::with_documents(vec![
            doc_a.clone(),
            doc_b.clone(),
        ]));
        let (indexer, _db) = indexer(source.clone());

        indexer.index_document("user-1", &doc_a).await.unwrap();
        indexer.index_document("user-1", &doc_b).await.unwrap();

        // B edited later, C appears, A unchanged.
        let mut doc_b_edited = doc_b.clone();
        doc_b_edited.last_edited_at = Utc::now();
        source.put_document(doc_b_edited);
        source.put_document(long_doc("c", Utc::now()));

        let changes = indexer.detect_changes("user-1").await.unwrap();
        assert_eq!(changes.new.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["c"]);
        assert_eq!(
            changes.modified.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            ["b"]
        );
        assert!(changes.deleted.is_empty());

        // Removing A from the source marks it deleted.
        source.remove_document("a");
        let changes = indexer.detect_changes("user-1").await.unwrap();
        assert_eq!(changes.deleted, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_index_all_isolates_failures() {
        let source = Arc::new(InMemorySource::with_documents(vec![
            long_doc("a", Utc::now()),
            long_doc("b", Utc::now()),
        ]));
        let db = Arc::new(IndexDb::in_memory().unwrap());
        let failing_pool = Arc::new(ProviderPool::new(
            vec![Arc::new(MockProvider::new("down").with_failure(MockFailure::Transient))
                as Arc<dyn AiProvider>],
            PoolConfig::default(),
        ));
        let indexer = Indexer::new(db, failing_pool, source, IndexerConfig::default());

        let report = indexer.index_all("user-1").await.unwrap();

        // Every document fails, but the pass completes and reports
        // each failure individually.
        assert_eq!(report.indexed, 0);
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_index_incremental_removes_deleted() {
        let doc = long_doc("a", Utc::now());
        let source = Arc::new(InMemorySource::with_documents(vec![doc.clone()]));
        let (indexer, db) = indexer(source.clone());

        indexer.index_document("user-1", &doc).await.unwrap();
        source.remove_document("a");

        let report = indexer.index_incremental("user-1").await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(db.get_stats().unwrap().document_count, 0);
    }
}
