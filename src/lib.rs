//! Vidbase Core Library
//!
//! Ingestion-and-retrieval core for an AI video knowledge base.
//! Submitted video URLs are driven through a resumable background job
//! pipeline (transcription, summarization, enrichment), the resulting
//! text is chunked and embedded into a local index, and the retriever
//! assembles bounded context from the most similar chunks at query time.
//!
//! The HTTP routing layer, rich-text conversion, and UI live in sibling
//! services; this crate exposes the pipeline through plain Rust types.

pub mod core;
pub mod telemetry;

pub use crate::core::{CoreError, CoreResult};
