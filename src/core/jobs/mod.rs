//! Job System Module
//!
//! Background ingestion jobs: one row per submitted video URL, driven
//! through a fixed pipeline (download metadata, transcribe, summarize,
//! extract key points, generate tags) by a polling worker.

mod processor;
mod store;

pub use processor::*;
pub use store::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, CoreResult, JobId, UserId};

/// Failures before a job is marked terminally failed
pub const MAX_RETRIES: u32 = 3;

// =============================================================================
// Platform
// =============================================================================

/// Supported video platforms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Youtube => write!(f, "youtube"),
            Platform::Instagram => write!(f, "instagram"),
        }
    }
}

impl Platform {
    /// Detects the platform from a submitted URL; unknown hosts are
    /// rejected at submission time.
    pub fn detect(url: &str) -> CoreResult<Self> {
        let lowered = url.to_lowercase();
        if lowered.contains("youtube.com") || lowered.contains("youtu.be") {
            Ok(Platform::Youtube)
        } else if lowered.contains("instagram.com") {
            Ok(Platform::Instagram)
        } else {
            Err(CoreError::UnsupportedPlatform(url.to_string()))
        }
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// Job pipeline status.
///
/// `pending → downloading → transcribing → summarizing → ready → saved`,
/// with `failed` reachable from any non-terminal state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in queue (or re-queued for retry)
    #[default]
    Pending,
    /// Claimed; fetching video metadata
    Downloading,
    /// Transcription in progress
    Transcribing,
    /// Summarization and enrichment in progress
    Summarizing,
    /// Pipeline complete; outputs ready to be saved
    Ready,
    /// Outputs persisted to the content source
    Saved,
    /// Terminally failed (retry budget spent)
    Failed,
}

impl JobStatus {
    /// Whether this status ends the job's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Saved | JobStatus::Failed)
    }

    /// Whether a worker currently owns this job
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobStatus::Downloading | JobStatus::Transcribing | JobStatus::Summarizing
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Summarizing => "summarizing",
            JobStatus::Ready => "ready",
            JobStatus::Saved => "saved",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "downloading" => Ok(JobStatus::Downloading),
            "transcribing" => Ok(JobStatus::Transcribing),
            "summarizing" => Ok(JobStatus::Summarizing),
            "ready" => Ok(JobStatus::Ready),
            "saved" => Ok(JobStatus::Saved),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CoreError::InvalidJobStatus(other.to_string())),
        }
    }
}

// =============================================================================
// Job
// =============================================================================

/// One ingestion job for a submitted video URL
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID (ULID)
    pub id: JobId,
    /// Owner
    pub user_id: UserId,
    /// Submitted video URL
    pub url: String,
    /// Detected platform
    pub platform: Platform,
    /// Optional user instruction folded into the summary prompt
    pub custom_instruction: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// Human-readable label for the current step
    pub current_step: Option<String>,
    /// Failures so far
    pub retry_count: u32,
    /// Identity of the worker holding the claim
    pub worker_id: Option<String>,
    /// Last recorded error
    pub error_message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When a worker first claimed the job
    pub started_at: Option<DateTime<Utc>>,
    /// When the pipeline reached `ready`
    pub completed_at: Option<DateTime<Utc>>,
    /// When the outputs were saved to the content source
    pub saved_at: Option<DateTime<Utc>>,
    /// Accumulated transcript text
    pub transcript: Option<String>,
    /// Summary markdown
    pub summary: Option<String>,
    /// Extracted key points
    pub key_points: Vec<String>,
    /// Generated tags
    pub tags: Vec<String>,
    /// Video title (best-effort metadata)
    pub video_title: Option<String>,
    /// Video thumbnail URL (best-effort metadata)
    pub thumbnail_url: Option<String>,
    /// Video duration in seconds (best-effort metadata)
    pub duration_secs: Option<f64>,
    /// Page created at the content source by the `saved` transition
    pub saved_page_id: Option<String>,
}

impl Job {
    /// Creates a new pending job, validating the URL's platform
    pub fn new(user_id: &str, url: &str) -> CoreResult<Self> {
        let platform = Platform::detect(url)?;

        Ok(Self {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            url: url.to_string(),
            platform,
            custom_instruction: None,
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            retry_count: 0,
            worker_id: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            saved_at: None,
            transcript: None,
            summary: None,
            key_points: Vec::new(),
            tags: Vec::new(),
            video_title: None,
            thumbnail_url: None,
            duration_secs: None,
            saved_page_id: None,
        })
    }

    /// Sets a custom instruction for summarization
    pub fn with_custom_instruction(mut self, instruction: &str) -> Self {
        self.custom_instruction = Some(instruction.to_string());
        self
    }
}

// =============================================================================
// Job Events
// =============================================================================

/// Progress events emitted while a job runs.
///
/// Delivery is best-effort: a dropped receiver never affects the
/// pipeline, which persists its own progress independently.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    /// Status transition
    StatusChanged { job_id: JobId, status: JobStatus },
    /// Progress update within the pipeline
    Progress {
        job_id: JobId,
        progress: u8,
        step: String,
    },
    /// One streamed summarization token
    SummaryToken { job_id: JobId, token: String },
    /// Pipeline finished; outputs are ready
    Completed { job_id: JobId },
    /// Pipeline failed
    Failed {
        job_id: JobId,
        error: String,
        will_retry: bool,
    },
}

// =============================================================================
// Tests
// =============================================================================
