//! Content Source Module
//!
//! Narrow contract to the external content store (e.g. a Notion-style
//! workspace): listing documents for indexing, archiving noise, and
//! creating a page from a finished job's outputs. Real backends live
//! outside this crate; the in-memory implementation backs tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::jobs::Job;
use crate::core::{CoreError, CoreResult, SourceId};

// =============================================================================
// Source Document
// =============================================================================

/// A document as reported by the content source
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    /// Identifier at the source
    pub id: SourceId,
    /// Document title
    pub title: String,
    /// Full text content
    pub content: String,
    /// Categories assigned at the source
    pub categories: Vec<String>,
    /// Tags assigned at the source
    pub tags: Vec<String>,
    /// Last-edited timestamp at the source
    pub last_edited_at: DateTime<Utc>,
}

// =============================================================================
// Content Source Trait
// =============================================================================

/// Read/archive/create access to the external content store
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Lists all documents, up to an optional limit
    async fn list_all_documents(&self, limit: Option<usize>) -> CoreResult<Vec<SourceDocument>>;

    /// Archives a document (best-effort soft delete)
    async fn archive(&self, id: &str) -> CoreResult<()>;

    /// Creates a page from a finished job's outputs; returns the new
    /// page's identifier
    async fn create_page(&self, job: &Job) -> CoreResult<String>;
}

// =============================================================================
// In-Memory Source (for testing)
// =============================================================================

/// In-memory content source for tests
#[derive(Default)]
pub struct InMemorySource {
    documents: Mutex<Vec<SourceDocument>>,
    archived: Mutex<Vec<SourceId>>,
    created_pages: Mutex<Vec<String>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the source with documents
    pub fn with_documents(documents: Vec<SourceDocument>) -> Self {
        Self {
            documents: Mutex::new(documents),
            archived: Mutex::new(Vec::new()),
            created_pages: Mutex::new(Vec::new()),
        }
    }

    /// Adds or replaces a document by id
    pub fn put_document(&self, doc: SourceDocument) {
        let mut documents = self.documents.lock().unwrap();
        documents.retain(|d| d.id != doc.id);
        documents.push(doc);
    }

    /// Removes a document by id
    pub fn remove_document(&self, id: &str) {
        self.documents.lock().unwrap().retain(|d| d.id != id);
    }

    /// IDs archived so far
    pub fn archived_ids(&self) -> Vec<SourceId> {
        self.archived.lock().unwrap().clone()
    }

    /// Page IDs created so far
    pub fn created_page_ids(&self) -> Vec<String> {
        self.created_pages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentSource for InMemorySource {
    async fn list_all_documents(&self, limit: Option<usize>) -> CoreResult<Vec<SourceDocument>> {
        let documents = self.documents.lock().unwrap();
        let mut result: Vec<SourceDocument> = documents.clone();
        if let Some(limit) = limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn archive(&self, id: &str) -> CoreResult<()> {
        let documents = self.documents.lock().unwrap();
        if !documents.iter().any(|d| d.id == id) {
            return Err(CoreError::DocumentNotFound(id.to_string()));
        }
        drop(documents);

        self.archived.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn create_page(&self, job: &Job) -> CoreResult<String> {
        let page_id = format!("page-{}", ulid::Ulid::new());
        self.created_pages.lock().unwrap().push(page_id.clone());
        let _ = job;
        Ok(page_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
