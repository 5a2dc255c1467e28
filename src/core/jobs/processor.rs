//! Job Processor
//!
//! Polling worker that claims pending jobs and drives them through the
//! ingestion pipeline: fetch metadata, transcribe, stream a summary,
//! then extract key points and tags. Every step persists its output
//! before the next begins, so a retried job resumes from durable state
//! rather than losing work.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use super::{Job, JobEvent, JobStatus, JobStore};
use crate::core::ai::{CompletionRequest, ProviderPool};
use crate::core::content::ContentSource;
use crate::core::transcription::{TranscribeOptions, Transcriber};
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Configuration
// =============================================================================

/// Processor configuration
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Seconds between queue polls when no job is pending
    pub poll_interval_secs: u64,
    /// Identity recorded on claimed jobs
    pub worker_id: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            worker_id: default_worker_id(),
        }
    }
}

fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string())
}

// =============================================================================
// Prompts
// =============================================================================

const SUMMARY_SYSTEM: &str = "You summarize video transcripts into clear, well-structured \
    markdown notes. Capture the main argument, concrete details, and any actionable advice. \
    Do not pad or editorialize.";

const KEY_POINTS_PROMPT: &str = "Extract the 3 to 7 most important points from this transcript. \
    Respond with a JSON array of strings and nothing else.";

const TAGS_PROMPT: &str = "Generate 3 to 5 short topical tags for this transcript. \
    Respond with a JSON array of lowercase strings and nothing else.";

/// Transcript characters sent to enrichment prompts
const ENRICHMENT_EXCERPT_CHARS: usize = 12_000;

// =============================================================================
// Job Processor
// =============================================================================

/// Background worker driving claimed jobs through the pipeline
pub struct JobProcessor {
    store: Arc<JobStore>,
    pool: Arc<ProviderPool>,
    transcriber: Arc<dyn Transcriber>,
    source: Arc<dyn ContentSource>,
    config: ProcessorConfig,
    event_tx: mpsc::UnboundedSender<JobEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<JobEvent>>>,
    shutdown: Arc<Notify>,
}

impl JobProcessor {
    /// Creates a new processor
    pub fn new(
        store: Arc<JobStore>,
        pool: Arc<ProviderPool>,
        transcriber: Arc<dyn Transcriber>,
        source: Arc<dyn ContentSource>,
        config: ProcessorConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            store,
            pool,
            transcriber,
            source,
            config,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Takes the event receiver. Callable once; the pipeline runs the
    /// same whether or not anyone listens.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Handle to request a graceful stop of `run`
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Submits a new job to the queue
    pub fn submit(&self, user_id: &str, url: &str, instruction: Option<&str>) -> CoreResult<Job> {
        let mut job = Job::new(user_id, url)?;
        if let Some(instruction) = instruction {
            job = job.with_custom_instruction(instruction);
        }
        self.store.create_job(&job)?;
        info!(job_id = %job.id, url, "Job submitted");
        Ok(job)
    }

    /// Runs the poll loop until shutdown is signalled. Processing
    /// errors are recorded on the job and never stop the loop.
    pub async fn run(&self) {
        info!(worker_id = %self.config.worker_id, "Job processor started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Job processor stopping");
                    break;
                }
                _ = sleep(Duration::from_secs(self.config.poll_interval_secs)) => {
                    if let Err(e) = self.poll_once().await {
                        error!("Queue poll failed: {}", e);
                    }
                }
            }
        }
    }

    /// Claims and processes at most one job. Returns whether a job
    /// was processed.
    pub async fn poll_once(&self) -> CoreResult<bool> {
        let Some(job) = self.store.claim_next(&self.config.worker_id)? else {
            return Ok(false);
        };

        let job_id = job.id.clone();
        if let Err(e) = self.process_job(job).await {
            let message = e.to_string();
            let status = self.store.fail_job(&job_id, &message)?;
            let will_retry = status == JobStatus::Pending;
            warn!(job_id = %job_id, will_retry, "Job failed: {}", message);
            self.emit(JobEvent::Failed {
                job_id: job_id.clone(),
                error: message,
                will_retry,
            });
            self.emit(JobEvent::StatusChanged { job_id, status });
        }
        Ok(true)
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn process_job(&self, job: Job) -> CoreResult<()> {
        let job_id = job.id.clone();
        info!(job_id = %job_id, url = %job.url, "Processing job");

        // Downloading: metadata is best-effort, the transcriber
        // fetches the media itself.
        self.transition(&job_id, JobStatus::Downloading, 10, "Fetching video metadata")?;
        match self.transcriber.video_info(&job.url).await {
            Ok(info) => {
                self.store.set_video_metadata(
                    &job_id,
                    info.title.as_deref(),
                    info.thumbnail.as_deref(),
                    info.duration,
                )?;
            }
            Err(e) => warn!(job_id = %job_id, "Video metadata unavailable: {}", e),
        }

        // Transcribing
        self.transition(&job_id, JobStatus::Transcribing, 25, "Transcribing audio")?;
        let transcript = self
            .transcriber
            .transcribe(&job.url, job.platform, &TranscribeOptions::default())
            .await
            .map_err(|e| CoreError::PipelineStepFailed {
                step: "transcribe".to_string(),
                message: e.to_string(),
            })?;

        self.store.set_transcript(&job_id, &transcript.text)?;
        self.store.set_video_metadata(
            &job_id,
            transcript.video_info.title.as_deref(),
            transcript.video_info.thumbnail.as_deref(),
            Some(transcript.duration),
        )?;
        self.progress(&job_id, 50, "Transcript ready");

        // Summarizing: stream tokens out as they arrive, accumulate
        // the full text for persistence.
        self.transition(&job_id, JobStatus::Summarizing, 60, "Summarizing")?;
        let summary = self
            .stream_summary(&job_id, &transcript.text, job.custom_instruction.as_deref())
            .await
            .map_err(|e| CoreError::PipelineStepFailed {
                step: "summarize".to_string(),
                message: e.to_string(),
            })?;
        self.store.set_summary(&job_id, &summary)?;

        // Enrichment: key points and tags in parallel. These are
        // pipeline steps like any other; a failure re-queues the job.
        self.progress(&job_id, 85, "Extracting key points and tags");
        let excerpt: String = transcript.text.chars().take(ENRICHMENT_EXCERPT_CHARS).collect();
        let (key_points, tags) = tokio::join!(
            self.extract_list(KEY_POINTS_PROMPT, &excerpt),
            self.extract_list(TAGS_PROMPT, &excerpt),
        );
        let key_points = key_points.map_err(|e| CoreError::PipelineStepFailed {
            step: "key_points".to_string(),
            message: e.to_string(),
        })?;
        let tags = tags.map_err(|e| CoreError::PipelineStepFailed {
            step: "tags".to_string(),
            message: e.to_string(),
        })?;
        self.store.set_enrichment(&job_id, &key_points, &tags)?;

        self.store.mark_ready(&job_id)?;
        self.emit(JobEvent::StatusChanged {
            job_id: job_id.clone(),
            status: JobStatus::Ready,
        });
        self.emit(JobEvent::Completed {
            job_id: job_id.clone(),
        });
        info!(job_id = %job_id, "Job ready");
        Ok(())
    }

    async fn stream_summary(
        &self,
        job_id: &str,
        transcript: &str,
        instruction: Option<&str>,
    ) -> CoreResult<String> {
        let mut prompt = format!("Summarize this video transcript:\n\n{}", transcript);
        if let Some(instruction) = instruction {
            prompt.push_str(&format!("\n\nAdditional instruction: {}", instruction));
        }
        let request = CompletionRequest::new(&prompt).with_system(SUMMARY_SYSTEM);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let event_tx = self.event_tx.clone();
        let job_id_owned = job_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                let _ = event_tx.send(JobEvent::SummaryToken {
                    job_id: job_id_owned.clone(),
                    token,
                });
            }
        });

        let result = self.pool.complete_streaming(request, tx).await;
        let _ = forwarder.await;
        Ok(result?.text)
    }

    async fn extract_list(&self, prompt: &str, excerpt: &str) -> CoreResult<Vec<String>> {
        let request = CompletionRequest::new(&format!("{}\n\nTranscript:\n{}", prompt, excerpt))
            .with_json_mode()
            .with_temperature(0.3);
        let response = self.pool.complete(request).await?;
        parse_string_array(&response.text)
    }

    // =========================================================================
    // Saving
    // =========================================================================

    /// Saves a ready job's outputs to the content source and marks it
    /// saved. Returns the created page id.
    pub async fn save_job(&self, job_id: &str) -> CoreResult<String> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;

        if job.status != JobStatus::Ready {
            return Err(CoreError::InvalidJobStatus(job.status.to_string()));
        }

        let page_id = self.source.create_page(&job).await?;
        self.store.mark_saved(job_id, &page_id)?;
        self.emit(JobEvent::StatusChanged {
            job_id: job_id.to_string(),
            status: JobStatus::Saved,
        });
        info!(job_id, page_id = %page_id, "Job saved");
        Ok(page_id)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: u8,
        step: &str,
    ) -> CoreResult<()> {
        self.store.set_status(job_id, status)?;
        self.store.update_progress(job_id, progress, step)?;
        self.emit(JobEvent::StatusChanged {
            job_id: job_id.to_string(),
            status,
        });
        self.emit(JobEvent::Progress {
            job_id: job_id.to_string(),
            progress,
            step: step.to_string(),
        });
        Ok(())
    }

    fn progress(&self, job_id: &str, progress: u8, step: &str) {
        if let Err(e) = self.store.update_progress(job_id, progress, step) {
            warn!(job_id, "Failed to persist progress: {}", e);
        }
        self.emit(JobEvent::Progress {
            job_id: job_id.to_string(),
            progress,
            step: step.to_string(),
        });
    }

    fn emit(&self, event: JobEvent) {
        // Delivery is best-effort; a dropped receiver is not an error.
        let _ = self.event_tx.send(event);
    }
}

// =============================================================================
// Response Parsing
// =============================================================================

/// Parses a JSON string array out of a model response, tolerating
/// markdown code fences around the payload.
fn parse_string_array(text: &str) -> CoreResult<Vec<String>> {
    if let Ok(items) = serde_json::from_str::<Vec<String>>(text) {
        return Ok(items);
    }

    let json_str = if text.contains("```json") {
        text.split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(text)
    } else if text.contains("```") {
        text.split("```")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(text)
    } else {
        text
    };

    serde_json::from_str(json_str.trim())
        .map_err(|e| CoreError::Internal(format!("Failed to parse list response: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ai::{MockProvider, PoolConfig};
    use crate::core::content::InMemorySource;
    use crate::core::transcription::MockTranscriber;

    fn processor_with(
        provider: MockProvider,
        transcriber: MockTranscriber,
    ) -> (JobProcessor, Arc<JobStore>, Arc<InMemorySource>) {
        let store = Arc::new(JobStore::in_memory().unwrap());
        let pool = Arc::new(ProviderPool::new(
            vec![Arc::new(provider)],
            PoolConfig::default(),
        ));
        let source = Arc::new(InMemorySource::new());
        let processor = JobProcessor::new(
            Arc::clone(&store),
            pool,
            Arc::new(transcriber),
            Arc::clone(&source) as Arc<dyn ContentSource>,
            ProcessorConfig {
                poll_interval_secs: 1,
                worker_id: "test-worker".to_string(),
            },
        );
        (processor, store, source)
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_ready() {
        let provider = MockProvider::new("mock").with_response(r#"["point one", "point two"]"#);
        let (processor, store, _) =
            processor_with(provider, MockTranscriber::new("hello transcript"));

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        assert!(processor.poll_once().await.unwrap());

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Ready);
        assert_eq!(loaded.progress, 100);
        assert_eq!(loaded.transcript.as_deref(), Some("hello transcript"));
        assert!(loaded.summary.is_some());
        assert_eq!(loaded.key_points, vec!["point one", "point two"]);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pipeline_emits_events() {
        let provider = MockProvider::new("mock").with_response(r#"["a"]"#);
        let (processor, _, _) = processor_with(provider, MockTranscriber::new("text"));
        let mut rx = processor.take_event_receiver().unwrap();

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        processor.poll_once().await.unwrap();

        let mut saw_summary_token = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                JobEvent::SummaryToken { job_id, .. } => {
                    assert_eq!(job_id, job.id);
                    saw_summary_token = true;
                }
                JobEvent::Completed { job_id } => {
                    assert_eq!(job_id, job.id);
                    saw_completed = true;
                }
                _ => {}
            }
        }
        assert!(saw_summary_token);
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_break_pipeline() {
        let provider = MockProvider::new("mock").with_response(r#"["a"]"#);
        let (processor, store, _) = processor_with(provider, MockTranscriber::new("text"));
        drop(processor.take_event_receiver());

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        processor.poll_once().await.unwrap();

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Ready);
    }

    #[tokio::test]
    async fn test_transcription_failure_requeues_job() {
        let provider = MockProvider::new("mock");
        let (processor, store, _) = processor_with(provider, MockTranscriber::failing());
        let mut rx = processor.take_event_receiver().unwrap();

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        assert!(processor.poll_once().await.unwrap());

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.error_message.is_some());

        let failed = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|e| match e {
            JobEvent::Failed { will_retry, .. } => Some(will_retry),
            _ => None,
        });
        assert_eq!(failed, Some(true));
    }

    #[tokio::test]
    async fn test_enrichment_failure_requeues_job() {
        // A provider response that does not parse as a string array
        // fails the enrichment step, not just degrades it.
        let provider = MockProvider::new("mock").with_response("not a json array");
        let (processor, store, _) = processor_with(provider, MockTranscriber::new("text"));

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        assert!(processor.poll_once().await.unwrap());

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.key_points.is_empty());
        assert!(loaded.error_message.unwrap().contains("key_points"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_terminally() {
        let provider = MockProvider::new("mock");
        let (processor, store, _) = processor_with(provider, MockTranscriber::failing());

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        // Each poll re-claims the re-queued job until the budget runs out.
        for _ in 0..3 {
            assert!(processor.poll_once().await.unwrap());
        }

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.retry_count, 3);
        assert!(!processor.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_job_creates_page() {
        let provider = MockProvider::new("mock").with_response(r#"["a"]"#);
        let (processor, store, source) = processor_with(provider, MockTranscriber::new("text"));

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        processor.poll_once().await.unwrap();

        let page_id = processor.save_job(&job.id).await.unwrap();
        assert_eq!(source.created_page_ids(), vec![page_id.clone()]);

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Saved);
        assert_eq!(loaded.saved_page_id, Some(page_id));

        // Saving again is rejected.
        assert!(processor.save_job(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_save_requires_ready() {
        let provider = MockProvider::new("mock");
        let (processor, _, _) = processor_with(provider, MockTranscriber::new("text"));

        let job = processor
            .submit("user-1", "https://youtu.be/abc", None)
            .unwrap();
        assert!(matches!(
            processor.save_job(&job.id).await,
            Err(CoreError::InvalidJobStatus(_))
        ));
    }

    #[test]
    fn test_parse_string_array_handles_fences() {
        assert_eq!(
            parse_string_array(r#"["a", "b"]"#).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            parse_string_array("```json\n[\"a\", \"b\"]\n```").unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            parse_string_array("```\n[\"a\"]\n```").unwrap(),
            vec!["a"]
        );
        assert!(parse_string_array("not json").is_err());
    }
}
