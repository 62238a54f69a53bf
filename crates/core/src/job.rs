//! Job record and lifecycle.
//!
//! A [`Job`] is created `Queued` at admission and moves through
//! `Submitted -> Polling -> Downloading -> Completed`. Any non-terminal
//! state may move to `Cancelled`; every state after `Queued` may move to
//! `Failed`. All mutators go through [`state_machine::validate_transition`]
//! so an out-of-order update is an error instead of a silent overwrite.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::request::{GenerationRequest, ImageRef, Mode, MusicRequest, OutputParams};
use crate::types::{JobId, RequesterId, Timestamp};

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Submitted,
    Polling,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states release the queue slot and accept no further
    /// transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Downloading => "downloading",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod state_machine {
    use super::JobState;
    use crate::error::CoreError;

    /// Returns the states reachable from `from`.
    ///
    /// Terminal states return an empty slice.
    pub fn valid_transitions(from: JobState) -> &'static [JobState] {
        use JobState::*;
        match from {
            Queued => &[Submitted, Cancelled],
            Submitted => &[Polling, Failed, Cancelled],
            Polling => &[Downloading, Failed, Cancelled],
            Downloading => &[Completed, Failed, Cancelled],
            Completed | Failed | Cancelled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: JobState, to: JobState) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition.
    pub fn validate_transition(from: JobState, to: JobState) -> Result<(), CoreError> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition { from, to })
        }
    }
}

// ---------------------------------------------------------------------------
// Remote handle / result
// ---------------------------------------------------------------------------

/// Reference to a finished remote artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    pub url: String,
    /// Expected size in bytes, when the provider reports it.
    #[serde(default)]
    pub size: Option<u64>,
    /// Expected lowercase hex sha256, when the provider reports it.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ResultRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            size: None,
            sha256: None,
        }
    }
}

/// Provider-assigned identity of a submitted job.
///
/// Providers that answer synchronously fill `ready` so the engine can skip
/// straight to the download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub task_id: String,
    #[serde(default)]
    pub ready: Option<ResultRef>,
}

impl RemoteHandle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ready: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Why a job ended in [`JobState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    /// Permanent provider error, or transient errors past the retry budget.
    Provider(String),
    /// The provider reported the generation itself as failed.
    Remote(String),
    /// No terminal status within the task timeout.
    Timeout { after_secs: u64 },
    /// The artifact could not be retrieved or failed verification.
    Download(String),
    /// The engine stopped before the job could finish.
    Aborted(String),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Provider(msg) => write!(f, "provider error: {msg}"),
            JobFailure::Remote(msg) => write!(f, "generation failed: {msg}"),
            JobFailure::Timeout { after_secs } => {
                write!(f, "timed out after {after_secs}s")
            }
            JobFailure::Download(msg) => write!(f, "download failed: {msg}"),
            JobFailure::Aborted(msg) => write!(f, "aborted: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One tracked generation request.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub requester: RequesterId,
    /// Model bound at admission. Never changes afterwards.
    pub model_id: String,
    pub prompt: String,
    pub mode: Mode,
    pub images: Vec<ImageRef>,
    pub params: OutputParams,
    pub music: Option<MusicRequest>,

    pub state: JobState,
    pub poll_count: u32,
    pub retry_count: u32,
    pub progress: u8,
    pub remote: Option<RemoteHandle>,
    pub result: Option<ResultRef>,
    pub artifact: Option<PathBuf>,
    pub downloaded_bytes: u64,
    pub failure: Option<JobFailure>,
    /// Parameter adjustments made while normalizing against model limits.
    pub warnings: Vec<String>,

    pub created_at: Timestamp,
    pub submitted_at: Option<Timestamp>,
    pub last_polled_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// Build a `Queued` job from an already validated request.
    pub fn new(
        id: JobId,
        request: GenerationRequest,
        model_id: impl Into<String>,
        params: OutputParams,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            id,
            requester: request.requester,
            model_id: model_id.into(),
            prompt: request.prompt.trim().to_string(),
            mode: request.mode,
            images: request.images,
            params,
            music: request.music.filter(|m| m.enabled),
            state: JobState::Queued,
            poll_count: 0,
            retry_count: 0,
            progress: 0,
            remote: None,
            result: None,
            artifact: None,
            downloaded_bytes: 0,
            failure: None,
            warnings,
            created_at: chrono::Utc::now(),
            submitted_at: None,
            last_polled_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, to: JobState) -> Result<(), CoreError> {
        state_machine::validate_transition(self.state, to)?;
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    /// `Queued -> Submitted`. Called right before the first provider call.
    pub fn mark_submitted(&mut self) -> Result<(), CoreError> {
        self.transition(JobState::Submitted)?;
        self.submitted_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// `Submitted -> Polling`, recording the remote handle.
    pub fn mark_polling(&mut self, handle: RemoteHandle) -> Result<(), CoreError> {
        self.transition(JobState::Polling)?;
        self.remote = Some(handle);
        Ok(())
    }

    /// Record one completed status check.
    pub fn record_poll(&mut self, progress: Option<u8>) {
        self.poll_count += 1;
        self.last_polled_at = Some(chrono::Utc::now());
        if let Some(p) = progress {
            self.progress = p.min(99).max(self.progress);
        }
    }

    /// Record one transient provider error that will be retried.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// `Polling -> Downloading`, recording the result reference.
    pub fn mark_downloading(&mut self, result: ResultRef) -> Result<(), CoreError> {
        self.transition(JobState::Downloading)?;
        self.result = Some(result);
        Ok(())
    }

    /// `Downloading -> Completed`.
    pub fn mark_completed(&mut self, path: PathBuf, bytes: u64) -> Result<(), CoreError> {
        self.transition(JobState::Completed)?;
        self.artifact = Some(path);
        self.downloaded_bytes = bytes;
        self.progress = 100;
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: JobFailure) -> Result<(), CoreError> {
        self.transition(JobState::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), CoreError> {
        self.transition(JobState::Cancelled)
    }

    /// Serializable snapshot for callers.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            requester: self.requester.clone(),
            model_id: self.model_id.clone(),
            prompt: self.prompt.clone(),
            mode: self.mode,
            params: self.params,
            music: self.music.is_some(),
            state: self.state,
            progress: self.progress,
            poll_count: self.poll_count,
            retry_count: self.retry_count,
            remote_task_id: self.remote.as_ref().map(|h| h.task_id.clone()),
            result_url: self.result.as_ref().map(|r| r.url.clone()),
            artifact: self.artifact.clone(),
            downloaded_bytes: self.downloaded_bytes,
            failure: self.failure.as_ref().map(ToString::to_string),
            warnings: self.warnings.clone(),
            created_at: self.created_at,
            submitted_at: self.submitted_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only view of a job returned by `status` and `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub requester: RequesterId,
    pub model_id: String,
    pub prompt: String,
    pub mode: Mode,
    pub params: OutputParams,
    pub music: bool,
    pub state: JobState,
    pub progress: u8,
    pub poll_count: u32,
    pub retry_count: u32,
    pub remote_task_id: Option<String>,
    pub result_url: Option<String>,
    pub artifact: Option<PathBuf>,
    pub downloaded_bytes: u64,
    pub failure: Option<String>,
    pub warnings: Vec<String>,
    pub created_at: Timestamp,
    pub submitted_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::state_machine::*;
    use super::*;
    use crate::request::Resolution;

    fn queued() -> Job {
        Job::new(
            JobId::from("abcd1234"),
            GenerationRequest::text("u1", "  a lighthouse at dusk "),
            "seedance",
            OutputParams {
                resolution: Resolution::P720,
                fps: 24,
                duration_secs: 5,
            },
            Vec::new(),
        )
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    #[test]
    fn terminal_states_have_no_transitions() {
        for s in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(valid_transitions(s).is_empty(), "{s} should be terminal");
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn every_active_state_can_be_cancelled() {
        for s in [
            JobState::Queued,
            JobState::Submitted,
            JobState::Polling,
            JobState::Downloading,
        ] {
            assert!(can_transition(s, JobState::Cancelled));
        }
    }

    #[test]
    fn queued_cannot_fail_directly() {
        assert!(!can_transition(JobState::Queued, JobState::Failed));
    }

    #[test]
    fn cannot_skip_polling() {
        assert_matches!(
            validate_transition(JobState::Submitted, JobState::Downloading),
            Err(CoreError::InvalidTransition { .. })
        );
    }

    // -----------------------------------------------------------------------
    // Job mutators
    // -----------------------------------------------------------------------

    #[test]
    fn happy_path_sets_timestamps_and_artifact() {
        let mut job = queued();
        assert_eq!(job.prompt, "a lighthouse at dusk");

        job.mark_submitted().unwrap();
        assert!(job.submitted_at.is_some());

        job.mark_polling(RemoteHandle::new("t-1")).unwrap();
        job.record_poll(Some(40));
        job.record_poll(None);
        assert_eq!(job.poll_count, 2);
        assert_eq!(job.progress, 40);

        job.mark_downloading(ResultRef::new("https://cdn.example/v.mp4"))
            .unwrap();
        job.mark_completed(PathBuf::from("/tmp/abcd1234.mp4"), 2048)
            .unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.finished_at.is_some());

        let summary = job.summary();
        assert_eq!(summary.remote_task_id.as_deref(), Some("t-1"));
        assert_eq!(summary.downloaded_bytes, 2048);
    }

    #[test]
    fn progress_never_regresses_or_reports_done_early() {
        let mut job = queued();
        job.record_poll(Some(70));
        job.record_poll(Some(30));
        assert_eq!(job.progress, 70);
        job.record_poll(Some(100));
        assert_eq!(job.progress, 99);
    }

    #[test]
    fn terminal_job_rejects_further_updates() {
        let mut job = queued();
        job.mark_cancelled().unwrap();
        assert_matches!(job.mark_submitted(), Err(CoreError::InvalidTransition { .. }));
        assert_matches!(job.mark_cancelled(), Err(CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn failure_is_rendered_in_summary() {
        let mut job = queued();
        job.mark_submitted().unwrap();
        job.mark_failed(JobFailure::Timeout { after_secs: 600 })
            .unwrap();
        assert_eq!(
            job.summary().failure.as_deref(),
            Some("timed out after 600s")
        );
    }
}
