//! Transcription Module
//!
//! Narrow HTTP contract to the external transcription worker. The
//! worker downloads the video, runs speech-to-text, and returns the
//! transcript with metadata. Transcription of long videos takes many
//! minutes, so the request timeout budget is a full hour.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::jobs::Platform;
use crate::core::{CoreError, CoreResult, TimeSec};

// =============================================================================
// Wire Types
// =============================================================================

/// Options for a transcription request
#[derive(Clone, Debug, Default)]
pub struct TranscribeOptions {
    /// Language hint; `None` means auto-detect
    pub language: Option<String>,
    /// Whether to include per-segment timestamps
    pub include_timestamps: bool,
}

/// One timestamped transcript segment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: TimeSec,
    pub end: TimeSec,
    pub text: String,
}

/// Result of a transcription call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transcript {
    /// Full transcript text
    pub text: String,
    /// Timestamped segments, when requested
    pub segments: Option<Vec<TranscriptSegment>>,
    /// Detected or requested language
    pub language: String,
    /// Media duration in seconds
    pub duration: TimeSec,
    /// Word count of the transcript
    pub word_count: u64,
    /// Metadata the worker gathered about the video
    pub video_info: VideoInfo,
}

/// Video metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

// =============================================================================
// Transcriber Trait
// =============================================================================

/// Client contract to the transcription worker
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribes the media at a URL
    async fn transcribe(
        &self,
        url: &str,
        platform: Platform,
        options: &TranscribeOptions,
    ) -> CoreResult<Transcript>;

    /// Fetches video metadata without transcribing. Best-effort;
    /// callers treat failures as non-fatal.
    async fn video_info(&self, url: &str) -> CoreResult<VideoInfo>;

    /// Whether the worker is up and its model is loaded
    async fn is_healthy(&self) -> bool;
}

// =============================================================================
// HTTP Transcriber
// =============================================================================

/// HTTP client to the transcription worker service
pub struct HttpTranscriber {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTranscriber {
    /// Timeout budget for a transcription call. Downloading plus
    /// speech-to-text on a long video can take most of an hour.
    pub const TRANSCRIBE_TIMEOUT_SECS: u64 = 3600;

    /// Creates a new client against the worker's base URL
    pub fn new(base_url: &str) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(Self::TRANSCRIBE_TIMEOUT_SECS))
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Creates a client from `TRANSCRIBER_BASE_URL`, defaulting to the
    /// worker's local development address.
    pub fn from_env() -> CoreResult<Self> {
        let base_url = std::env::var("TRANSCRIBER_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        Self::new(&base_url)
    }
}

// Wire shapes match the worker's API (snake_case JSON).

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    url: &'a str,
    platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    include_timestamps: bool,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    success: bool,
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Option<Vec<WireSegment>>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    word_count: u64,
    #[serde(default)]
    video_info: VideoInfo,
}

#[derive(Deserialize)]
struct WireSegment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct VideoInfoRequest<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    whisper_loaded: bool,
}

#[derive(Deserialize)]
struct WorkerError {
    #[serde(default)]
    detail: Option<String>,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        url: &str,
        platform: Platform,
        options: &TranscribeOptions,
    ) -> CoreResult<Transcript> {
        let request = TranscribeRequest {
            url,
            platform: platform.to_string(),
            language: options.language.as_deref(),
            include_timestamps: options.include_timestamps,
        };

        let endpoint = format!("{}/transcribe", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                CoreError::TranscriptionFailed(format!("Worker request failed: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            CoreError::TranscriptionFailed(format!("Failed to read worker response: {}", e))
        })?;

        if !status.is_success() {
            let error: WorkerError = serde_json::from_str(&body).unwrap_or(WorkerError {
                detail: Some(body.clone()),
            });
            return Err(CoreError::TranscriptionFailed(format!(
                "Worker error ({}): {}",
                status,
                error.detail.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        let parsed: TranscribeResponse = serde_json::from_str(&body).map_err(|e| {
            CoreError::TranscriptionFailed(format!("Failed to parse worker response: {}", e))
        })?;

        if !parsed.success {
            return Err(CoreError::TranscriptionFailed(
                "Worker reported failure".to_string(),
            ));
        }

        Ok(Transcript {
            text: parsed.text,
            segments: parsed.segments.map(|segments| {
                segments
                    .into_iter()
                    .map(|s| TranscriptSegment {
                        start: s.start,
                        end: s.end,
                        text: s.text,
                    })
                    .collect()
            }),
            language: parsed.language,
            duration: parsed.duration,
            word_count: parsed.word_count,
            video_info: parsed.video_info,
        })
    }

    async fn video_info(&self, url: &str) -> CoreResult<VideoInfo> {
        let endpoint = format!("{}/video/info", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&VideoInfoRequest { url })
            .send()
            .await
            .map_err(|e| {
                CoreError::TranscriptionFailed(format!("Video info request failed: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            CoreError::TranscriptionFailed(format!("Failed to read worker response: {}", e))
        })?;

        if !status.is_success() {
            return Err(CoreError::TranscriptionFailed(format!(
                "Video info error ({}): {}",
                status, body
            )));
        }

        let info: VideoInfo = serde_json::from_str(&body).map_err(|e| {
            CoreError::TranscriptionFailed(format!("Failed to parse video info: {}", e))
        })?;
        Ok(info)
    }

    async fn is_healthy(&self) -> bool {
        let endpoint = format!("{}/health", self.base_url);
        match self.client.get(&endpoint).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthResponse>().await {
                    Ok(health) => health.status == "ok" && health.whisper_loaded,
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }
}

// =============================================================================
// Mock Transcriber (for testing)
// =============================================================================

/// Mock transcriber for tests
pub struct MockTranscriber {
    text: String,
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl MockTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Makes every call fail
    pub fn failing() -> Self {
        Self {
            text: String::new(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// URLs transcribed so far
    pub fn transcribed_urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(
        &self,
        url: &str,
        _platform: Platform,
        _options: &TranscribeOptions,
    ) -> CoreResult<Transcript> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.fail {
            return Err(CoreError::TranscriptionFailed(
                "simulated transcription failure".to_string(),
            ));
        }

        Ok(Transcript {
            text: self.text.clone(),
            segments: None,
            language: "en".to_string(),
            duration: 120.0,
            word_count: self.text.split_whitespace().count() as u64,
            video_info: VideoInfo {
                id: Some("abc".to_string()),
                title: Some("Mock video".to_string()),
                duration: Some(120.0),
                channel: Some("Mock channel".to_string()),
                upload_date: None,
                thumbnail: Some("https://example.com/thumb.jpg".to_string()),
            },
        })
    }

    async fn video_info(&self, _url: &str) -> CoreResult<VideoInfo> {
        if self.fail {
            return Err(CoreError::TranscriptionFailed(
                "simulated metadata failure".to_string(),
            ));
        }
        Ok(VideoInfo {
            id: Some("abc".to_string()),
            title: Some("Mock video".to_string()),
            duration: Some(120.0),
            channel: Some("Mock channel".to_string()),
            upload_date: None,
            thumbnail: Some("https://example.com/thumb.jpg".to_string()),
        })
    }

    async fn is_healthy(&self) -> bool {
        !self.fail
    }
}

// =============================================================================
// Tests
// =============================================================================
