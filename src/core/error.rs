//! Vidbase Error Definitions
//!
//! Defines error types used throughout the project.

use thiserror::Error;

use super::JobId;

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job status '{0}'")]
    InvalidJobStatus(String),

    #[error("Unsupported video platform for URL: {0}")]
    UnsupportedPlatform(String),

    #[error("Job pipeline step '{step}' failed: {message}")]
    PipelineStepFailed { step: String, message: String },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("AI request failed: {0}")]
    AiRequestFailed(String),

    #[error("Rate limited (retry after {retry_after_secs}s): {message}")]
    RateLimited {
        retry_after_secs: u64,
        message: String,
    },

    #[error("All providers exhausted after {attempts} attempts: {last_error}")]
    ProvidersExhausted { attempts: u32, last_error: String },

    // =========================================================================
    // Transcription Errors
    // =========================================================================
    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    // =========================================================================
    // Indexing / Retrieval Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Capability not ready: {0}")]
    NotReady(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// True for errors worth retrying on a different provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::AiRequestFailed(_) | CoreError::RateLimited { .. }
        )
    }
}
