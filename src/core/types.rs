//! Vidbase Core Type Definitions
//!
//! Defines fundamental types used throughout the project.

// =============================================================================
// ID Types
// =============================================================================

/// Job unique identifier (ULID)
pub type JobId = String;

/// Owner/user identifier
pub type UserId = String;

/// Source-document identifier (id in the external content store)
pub type SourceId = String;

/// Indexed-document row identifier (ULID)
pub type DocumentId = String;

// =============================================================================
// Time Types
// =============================================================================

/// Time in seconds (floating point)
pub type TimeSec = f64;
