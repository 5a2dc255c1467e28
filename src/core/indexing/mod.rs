//! Indexing Module
//!
//! Turns source documents into embedded, searchable chunks and keeps
//! the local index in sync with the content source.

mod db;
mod indexer;

pub use db::*;
pub use indexer::*;
