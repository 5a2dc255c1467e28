//! Index Database Module
//!
//! SQLite store for indexed documents and their embedded chunks.
//! Vectors are stored as little-endian f32 BLOBs. The connection sits
//! behind a mutex so the store can be shared across async tasks.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, CoreResult, DocumentId, SourceId, UserId};

// =============================================================================
// Stored Types
// =============================================================================

/// One indexed source document
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    /// Internal document ID (ULID)
    pub id: DocumentId,
    /// Owner
    pub user_id: UserId,
    /// Identifier of the document at the content source
    pub source_id: SourceId,
    /// Document title
    pub title: String,
    /// Resolved category, if any
    pub category: Option<String>,
    /// Resolved tags
    pub tags: Vec<String>,
    /// Last-edited timestamp reported by the source
    pub last_edited_at: DateTime<Utc>,
    /// When this document was last indexed
    pub indexed_at: DateTime<Utc>,
}

/// One embedded chunk row
#[derive(Clone, Debug)]
pub struct StoredChunk {
    /// Chunk ID (ULID)
    pub id: String,
    /// Parent document ID
    pub document_id: DocumentId,
    /// Position within the document, contiguous from 0
    pub ordinal: u32,
    /// Chunk text
    pub content: String,
    /// Approximate token count
    pub token_count: u32,
    /// Embedding vector
    pub embedding: Vec<f32>,
    /// Parent document title (joined in on read)
    pub document_title: String,
}

/// A chunk scored against a query embedding
#[derive(Clone, Debug)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    pub similarity: f32,
}

/// Index statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub document_count: u64,
    pub chunk_count: u64,
}

// =============================================================================
// Chunk Store Seam
// =============================================================================

/// Read access to stored chunks for retrieval.
///
/// `native_search` is the accelerated path; a backend without vector
/// search support returns [`CoreError::NotSupported`] and the caller
/// falls back to `fetch_chunks` plus in-process cosine similarity.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Vector similarity search executed by the store itself
    async fn native_search(
        &self,
        embedding: &[f32],
        threshold: f32,
        limit: usize,
        user_id: &str,
        category: Option<&str>,
    ) -> CoreResult<Vec<ScoredChunk>>;

    /// Fetches all chunks for an owner, optionally filtered by category
    async fn fetch_chunks(
        &self,
        user_id: &str,
        category: Option<&str>,
    ) -> CoreResult<Vec<StoredChunk>>;
}

// =============================================================================
// Vector Encoding
// =============================================================================

/// Encodes an f32 vector as little-endian bytes
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes little-endian bytes back into an f32 vector
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// =============================================================================
// Index Database
// =============================================================================

/// SQLite database for document and chunk indexing
pub struct IndexDb {
    conn: Mutex<Connection>,
}

impl IndexDb {
    /// Creates a new index database at the specified path
    pub fn create<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("Failed to create index database: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Opens an index database, creating the schema if missing
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("Failed to open index database: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Creates an in-memory database (for testing)
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Storage(format!("Failed to create in-memory database: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initializes the database schema
    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Documents table: one row per indexed source document
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                title TEXT NOT NULL,
                category TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                last_edited_at TEXT NOT NULL,
                indexed_at TEXT NOT NULL,
                UNIQUE(user_id, source_id)
            );

            -- Chunks table: embedded fragments of a document
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding BLOB NOT NULL
            );

            -- Indexes for efficient queries
            CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(user_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, ordinal);
            "#,
        )
        .map_err(|e| CoreError::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Inserts or updates a document row, keyed on (user_id, source_id)
    pub fn upsert_document(&self, doc: &IndexedDocument) -> CoreResult<DocumentId> {
        let conn = self.conn.lock().unwrap();
        let tags = serde_json::to_string(&doc.tags)?;

        conn.execute(
            r#"
            INSERT INTO documents (id, user_id, source_id, title, category, tags, last_edited_at, indexed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id, source_id) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                tags = excluded.tags,
                last_edited_at = excluded.last_edited_at,
                indexed_at = excluded.indexed_at
            "#,
            params![
                doc.id,
                doc.user_id,
                doc.source_id,
                doc.title,
                doc.category,
                tags,
                doc.last_edited_at.to_rfc3339(),
                doc.indexed_at.to_rfc3339(),
            ],
        )?;

        // The upsert may have kept a pre-existing row id.
        let id: String = conn.query_row(
            "SELECT id FROM documents WHERE user_id = ?1 AND source_id = ?2",
            params![doc.user_id, doc.source_id],
            |row| row.get(0),
        )?;

        Ok(id)
    }

    /// Replaces a document's chunk set entirely (delete-then-insert)
    pub fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[(String, String, u32, Vec<f32>)],
    ) -> CoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id],
        )?;

        for (ordinal, (id, content, token_count, embedding)) in chunks.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, content, token_count, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    id,
                    document_id,
                    ordinal as u32,
                    content,
                    token_count,
                    encode_vector(embedding),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Deletes a document and its chunks; returns whether a row existed
    pub fn delete_document(&self, user_id: &str, source_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            DELETE FROM chunks WHERE document_id IN (
                SELECT id FROM documents WHERE user_id = ?1 AND source_id = ?2
            )
            "#,
            params![user_id, source_id],
        )?;

        let deleted = conn.execute(
            "DELETE FROM documents WHERE user_id = ?1 AND source_id = ?2",
            params![user_id, source_id],
        )?;

        Ok(deleted > 0)
    }

    /// Looks up a document by source identifier
    pub fn get_document(&self, user_id: &str, source_id: &str) -> CoreResult<Option<IndexedDocument>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                r#"
                SELECT id, user_id, source_id, title, category, tags, last_edited_at, indexed_at
                FROM documents WHERE user_id = ?1 AND source_id = ?2
                "#,
                params![user_id, source_id],
                Self::map_document,
            )
            .optional()?;

        Ok(row)
    }

    /// Lists (source_id, last_edited_at) for every indexed document of
    /// an owner. This is the indexed side of the change diff.
    pub fn list_indexed(&self, user_id: &str) -> CoreResult<Vec<(SourceId, DateTime<Utc>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT source_id, last_edited_at FROM documents WHERE user_id = ?1")?;

        let rows = stmt.query_map(params![user_id], |row| {
            let source_id: String = row.get(0)?;
            let edited: String = row.get(1)?;
            Ok((source_id, edited))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (source_id, edited) = row?;
            let edited = DateTime::parse_from_rfc3339(&edited)
                .map_err(|e| CoreError::Storage(format!("Bad timestamp in index: {}", e)))?
                .with_timezone(&Utc);
            result.push((source_id, edited));
        }
        Ok(result)
    }

    /// Gets statistics about the index
    pub fn get_stats(&self) -> CoreResult<IndexStats> {
        let conn = self.conn.lock().unwrap();

        let document_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let chunk_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;

        Ok(IndexStats {
            document_count: document_count as u64,
            chunk_count: chunk_count as u64,
        })
    }

    fn map_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedDocument> {
        let tags: String = row.get(5)?;
        let last_edited: String = row.get(6)?;
        let indexed: String = row.get(7)?;

        Ok(IndexedDocument {
            id: row.get(0)?,
            user_id: row.get(1)?,
            source_id: row.get(2)?,
            title: row.get(3)?,
            category: row.get(4)?,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            last_edited_at: DateTime::parse_from_rfc3339(&last_edited)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
            indexed_at: DateTime::parse_from_rfc3339(&indexed)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
        })
    }
}

// =============================================================================
// ChunkStore Implementation
// =============================================================================

#[async_trait]
impl ChunkStore for IndexDb {
    async fn native_search(
        &self,
        _embedding: &[f32],
        _threshold: f32,
        _limit: usize,
        _user_id: &str,
        _category: Option<&str>,
    ) -> CoreResult<Vec<ScoredChunk>> {
        // Plain SQLite has no vector index; retrieval falls back to
        // the brute-force path.
        Err(CoreError::NotSupported(
            "SQLite backend has no native vector search".to_string(),
        ))
    }

    async fn fetch_chunks(
        &self,
        user_id: &str,
        category: Option<&str>,
    ) -> CoreResult<Vec<StoredChunk>> {
        let conn = self.conn.lock().unwrap();

        let mut sql = String::from(
            r#"
            SELECT c.id, c.document_id, c.ordinal, c.content, c.token_count, c.embedding, d.title
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.user_id = ?1
            "#,
        );
        if category.is_some() {
            sql.push_str(" AND d.category = ?2");
        }

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<StoredChunk> {
            let embedding: Vec<u8> = row.get(5)?;
            Ok(StoredChunk {
                id: row.get(0)?,
                document_id: row.get(1)?,
                ordinal: row.get(2)?,
                content: row.get(3)?,
                token_count: row.get(4)?,
                embedding: decode_vector(&embedding),
                document_title: row.get(6)?,
            })
        };

        let rows = match category {
            Some(cat) => stmt.query_map(params![user_id, cat], map_row)?,
            None => stmt.query_map(params![user_id], map_row)?,
        };

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn doc(user_id: &str, source_id: &str, title: &str) -> IndexedDocument {
        IndexedDocument {
            id: Ulid::new().to_string(),
            user_id: user_id.to_string(),
            source_id: source_id.to_string(),
            title: title.to_string(),
            category: Some("videos".to_string()),
            tags: vec!["rust".to_string()],
            last_edited_at: Utc::now(),
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_in_memory_db() {
        let db = IndexDb::in_memory().unwrap();
        let stats = db.get_stats().unwrap();

        assert_eq!(stats.document_count, 0);
        assert_eq!(stats.chunk_count, 0);
    }

    #[test]
    fn test_create_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        let db = IndexDb::create(&path).unwrap();
        drop(db);

        assert!(path.exists());
        let reopened = IndexDb::open(&path).unwrap();
        assert_eq!(reopened.get_stats().unwrap().document_count, 0);
    }

    #[test]
    fn test_open_fresh_path_initializes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        // open on a path that never saw create still sets up tables.
        let db = IndexDb::open(&path).unwrap();
        assert_eq!(db.get_stats().unwrap().document_count, 0);
    }

    #[test]
    fn test_vector_round_trip() {
        let vector = vec![0.5_f32, -1.25, 3.0, 0.0];
        let decoded = decode_vector(&encode_vector(&vector));

        assert_eq!(decoded, vector);
    }

    #[test]
    fn test_upsert_document_is_idempotent_per_source() {
        let db = IndexDb::in_memory().unwrap();

        let first = doc("user-1", "page-1", "Original title");
        let first_id = db.upsert_document(&first).unwrap();

        let mut second = doc("user-1", "page-1", "Updated title");
        second.id = Ulid::new().to_string();
        let second_id = db.upsert_document(&second).unwrap();

        // Same (user, source) pair keeps a single row with the
        // original internal id.
        assert_eq!(first_id, second_id);
        assert_eq!(db.get_stats().unwrap().document_count, 1);

        let stored = db.get_document("user-1", "page-1").unwrap().unwrap();
        assert_eq!(stored.title, "Updated title");
    }

    #[test]
    fn test_replace_chunks_delete_then_insert() {
        let db = IndexDb::in_memory().unwrap();
        let id = db.upsert_document(&doc("user-1", "page-1", "Doc")).unwrap();

        let chunks = vec![
            (Ulid::new().to_string(), "first".to_string(), 1, vec![1.0, 0.0]),
            (Ulid::new().to_string(), "second".to_string(), 2, vec![0.0, 1.0]),
        ];
        db.replace_chunks(&id, &chunks).unwrap();
        assert_eq!(db.get_stats().unwrap().chunk_count, 2);

        let replacement = vec![(
            Ulid::new().to_string(),
            "only".to_string(),
            1,
            vec![0.5, 0.5],
        )];
        db.replace_chunks(&id, &replacement).unwrap();
        assert_eq!(db.get_stats().unwrap().chunk_count, 1);
    }

    #[test]
    fn test_delete_document_reports_existence() {
        let db = IndexDb::in_memory().unwrap();
        db.upsert_document(&doc("user-1", "page-1", "Doc")).unwrap();

        assert!(db.delete_document("user-1", "page-1").unwrap());
        assert!(!db.delete_document("user-1", "page-1").unwrap());
    }

    #[tokio::test]
    async fn test_fetch_chunks_scoped_to_owner() {
        let db = IndexDb::in_memory().unwrap();

        let mine = db.upsert_document(&doc("user-1", "page-1", "Mine")).unwrap();
        let theirs = db.upsert_document(&doc("user-2", "page-2", "Theirs")).unwrap();

        db.replace_chunks(&mine, &[(Ulid::new().to_string(), "a".to_string(), 1, vec![1.0])])
            .unwrap();
        db.replace_chunks(&theirs, &[(Ulid::new().to_string(), "b".to_string(), 1, vec![1.0])])
            .unwrap();

        let chunks = db.fetch_chunks("user-1", None).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].document_title, "Mine");
    }

    #[tokio::test]
    async fn test_native_search_not_supported() {
        let db = IndexDb::in_memory().unwrap();
        let result = db.native_search(&[1.0], 0.5, 5, "user-1", None).await;

        assert!(matches!(result, Err(CoreError::NotSupported(_))));
    }
}
