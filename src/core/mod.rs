//! Vidbase Core Engine
//!
//! Core pipeline module.
//! Handles job processing, provider failover, chunk indexing, and retrieval.

pub mod ai;
pub mod chunker;
pub mod content;
pub mod indexing;
pub mod jobs;
pub mod retrieval;
pub mod transcription;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;
