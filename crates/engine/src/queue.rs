//! Bounded job queue with admission control and cancellation.
//!
//! The queue owns every active [`Job`] behind a per-job mutex. Workers never
//! mutate a job directly; they go through [`QueueManager::update`], which
//! refuses to touch a job once it is terminal. That refusal is how results
//! that arrive after a cancellation get discarded.
//!
//! Terminal jobs leave the active set immediately and their summaries move to
//! a bounded history that is evicted lazily on `submit`, `status` and `list`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidgen_core::{
    CoreError, EngineConfig, GenerationRequest, Job, JobId, JobState, JobSummary, RemoteHandle,
    RequesterId,
};
use vidgen_providers::RegisteredModel;

use crate::events::{EventBus, JobEvent};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Who is asking to cancel a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelScope {
    /// Only the requester's own jobs.
    Requester(RequesterId),
    /// Any job.
    Admin,
}

impl CancelScope {
    fn permits(&self, owner: &RequesterId) -> bool {
        match self {
            CancelScope::Admin => true,
            CancelScope::Requester(who) => who == owner,
        }
    }
}

/// One admitted job plus everything bound to it at admission.
pub struct JobEntry {
    pub id: JobId,
    /// Model bound at admission. Never replaced.
    pub model: Arc<RegisteredModel>,
    /// Fired when the job is cancelled or the engine shuts down.
    pub cancel: CancellationToken,
    seq: u64,
    job: Mutex<Job>,
}

impl std::fmt::Debug for JobEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEntry")
            .field("id", &self.id)
            .field("model", &self.model.id)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl JobEntry {
    /// Clone of the current job record.
    pub async fn snapshot(&self) -> Job {
        self.job.lock().await.clone()
    }

    pub async fn summary(&self) -> JobSummary {
        self.job.lock().await.summary()
    }

    pub async fn state(&self) -> JobState {
        self.job.lock().await.state
    }
}

/// Result of a successful cancellation.
#[derive(Debug)]
pub struct CancelOutcome {
    pub summary: JobSummary,
    /// Remote task to cancel best-effort, if the job got that far.
    pub remote: Option<RemoteHandle>,
    pub model: Arc<RegisteredModel>,
}

struct Finished {
    seq: u64,
    at: Instant,
    summary: JobSummary,
}

#[derive(Default)]
struct QueueInner {
    /// Set once by `close`; admission is refused from then on.
    closed: bool,
    next_seq: u64,
    active: IndexMap<JobId, Arc<JobEntry>>,
    /// Oldest first.
    history: VecDeque<Finished>,
}

impl QueueInner {
    fn evict(&mut self, retention: Duration, limit: usize) {
        let now = Instant::now();
        while self
            .history
            .front()
            .is_some_and(|f| now.duration_since(f.at) >= retention)
        {
            self.history.pop_front();
        }
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    fn finished(&self, id: &JobId) -> Option<&Finished> {
        self.history.iter().rev().find(|f| &f.summary.id == id)
    }

    fn id_in_use(&self, id: &JobId) -> bool {
        self.active.contains_key(id) || self.finished(id).is_some()
    }
}

// ---------------------------------------------------------------------------
// QueueManager
// ---------------------------------------------------------------------------

/// FIFO set of active jobs with a fixed capacity.
pub struct QueueManager {
    capacity: usize,
    retention: Duration,
    history_limit: usize,
    events: Arc<EventBus>,
    /// Parent of every per-job token.
    shutdown: CancellationToken,
    inner: Mutex<QueueInner>,
}

impl QueueManager {
    pub fn new(config: &EngineConfig, events: Arc<EventBus>, shutdown: CancellationToken) -> Self {
        Self {
            capacity: config.max_queue_size,
            retention: config.history_retention,
            history_limit: config.history_limit,
            events,
            shutdown,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a request bound to `model`.
    ///
    /// Fails fast with `Validation` when the request is malformed or needs a
    /// feature the model lacks, with `QueueFull` when every slot is taken,
    /// and with `ShuttingDown` once the queue is closed. Output parameters are normalized against the model's limits;
    /// adjustments are kept as warnings on the job.
    pub async fn submit(
        &self,
        request: GenerationRequest,
        model: Arc<RegisteredModel>,
    ) -> Result<Arc<JobEntry>, CoreError> {
        request.validate()?;
        model.capabilities().check(&model.id, &request)?;
        let (params, warnings) = model.profile.normalize(&request);

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CoreError::ShuttingDown);
        }
        inner.evict(self.retention, self.history_limit);

        if inner.active.len() >= self.capacity {
            tracing::warn!(
                requester = %request.requester,
                capacity = self.capacity,
                "Queue full, rejecting submission",
            );
            return Err(CoreError::QueueFull {
                capacity: self.capacity,
            });
        }

        let mut id = JobId::generate();
        while inner.id_in_use(&id) {
            id = JobId::generate();
        }

        for warning in &warnings {
            tracing::warn!(job_id = %id, model_id = %model.id, warning = %warning, "Request parameter adjusted");
        }

        let job = Job::new(id.clone(), request, model.id.clone(), params, warnings);
        let summary = job.summary();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = Arc::new(JobEntry {
            id: id.clone(),
            model,
            cancel: self.shutdown.child_token(),
            seq,
            job: Mutex::new(job),
        });
        inner.active.insert(id.clone(), Arc::clone(&entry));
        let active = inner.active.len();
        drop(inner);

        tracing::info!(
            job_id = %id,
            requester = %summary.requester,
            model_id = %summary.model_id,
            mode = %summary.mode,
            resolution = %summary.params.resolution,
            fps = summary.params.fps,
            duration_secs = summary.params.duration_secs,
            active,
            "Job queued",
        );
        self.events.publish(JobEvent::from_summary(&summary));
        Ok(entry)
    }

    /// Active entry for `id`, if the job is not terminal yet.
    pub async fn entry(&self, id: &JobId) -> Option<Arc<JobEntry>> {
        self.inner.lock().await.active.get(id).cloned()
    }

    /// Apply `f` to a live job.
    ///
    /// Returns `false` without calling `f` when the job is already terminal,
    /// and `false` when `f` rejects the transition. State or progress changes
    /// are published; a terminal result releases the queue slot.
    pub async fn update<F>(&self, entry: &JobEntry, f: F) -> bool
    where
        F: FnOnce(&mut Job) -> Result<(), CoreError>,
    {
        let mut job = entry.job.lock().await;
        if job.is_terminal() {
            tracing::debug!(job_id = %entry.id, state = %job.state, "Discarding update for finished job");
            return false;
        }

        let before = (job.state, job.progress);
        if let Err(e) = f(&mut job) {
            tracing::debug!(job_id = %entry.id, error = %e, "Update rejected");
            return false;
        }
        if (job.state, job.progress) == before {
            return true;
        }

        let summary = job.summary();
        if summary.state.is_terminal() {
            self.retire(entry.seq, &summary).await;
        }
        drop(job);

        self.events.publish(JobEvent::from_summary(&summary));
        true
    }

    /// Cancel a non-terminal job.
    ///
    /// The per-job token fires after the state change, so workers that wake
    /// on it always find the job already `Cancelled`.
    pub async fn cancel(&self, id: &JobId, scope: &CancelScope) -> Result<CancelOutcome, CoreError> {
        let entry = {
            let mut inner = self.inner.lock().await;
            match inner.active.get(id) {
                Some(entry) => Arc::clone(entry),
                None => {
                    inner.evict(self.retention, self.history_limit);
                    return match inner.finished(id) {
                        Some(f) => Err(CoreError::NotCancellable {
                            id: id.clone(),
                            state: f.summary.state,
                        }),
                        None => Err(CoreError::NotFound(id.clone())),
                    };
                }
            }
        };

        let mut job = entry.job.lock().await;
        if !scope.permits(&job.requester) {
            return Err(CoreError::Forbidden(format!(
                "job {id} belongs to another requester"
            )));
        }
        if job.is_terminal() {
            return Err(CoreError::NotCancellable {
                id: id.clone(),
                state: job.state,
            });
        }

        let from = job.state;
        job.mark_cancelled()?;
        let summary = job.summary();
        let remote = job.remote.clone();
        self.retire(entry.seq, &summary).await;
        drop(job);

        entry.cancel.cancel();
        tracing::info!(job_id = %id, from = %from, admin = matches!(scope, CancelScope::Admin), "Job cancelled");
        self.events.publish(JobEvent::from_summary(&summary));

        Ok(CancelOutcome {
            summary,
            remote,
            model: Arc::clone(&entry.model),
        })
    }

    /// Refuse new jobs and cancel every active one.
    ///
    /// Each job ends `Cancelled` and gives up its slot before its token
    /// fires. Returns the outcomes so remote tasks can be cancelled too.
    pub async fn close(&self) -> Vec<CancelOutcome> {
        let active: Vec<Arc<JobEntry>> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner.active.values().cloned().collect()
        };

        let mut outcomes = Vec::with_capacity(active.len());
        for entry in active {
            let mut job = entry.job.lock().await;
            if job.is_terminal() {
                continue;
            }
            let from = job.state;
            if let Err(e) = job.mark_cancelled() {
                tracing::warn!(job_id = %entry.id, error = %e, "Could not cancel job on close");
                continue;
            }
            let summary = job.summary();
            let remote = job.remote.clone();
            self.retire(entry.seq, &summary).await;
            drop(job);

            entry.cancel.cancel();
            tracing::info!(job_id = %entry.id, from = %from, "Job cancelled on shutdown");
            self.events.publish(JobEvent::from_summary(&summary));
            outcomes.push(CancelOutcome {
                summary,
                remote,
                model: Arc::clone(&entry.model),
            });
        }
        outcomes
    }

    pub async fn status(&self, id: &JobId) -> Result<JobSummary, CoreError> {
        let entry = {
            let mut inner = self.inner.lock().await;
            match inner.active.get(id) {
                Some(entry) => Arc::clone(entry),
                None => {
                    inner.evict(self.retention, self.history_limit);
                    return inner
                        .finished(id)
                        .map(|f| f.summary.clone())
                        .ok_or_else(|| CoreError::NotFound(id.clone()));
                }
            }
        };
        Ok(entry.summary().await)
    }

    /// Active and retained jobs in submission order.
    pub async fn list(&self) -> Vec<JobSummary> {
        let (active, mut rows) = {
            let mut inner = self.inner.lock().await;
            inner.evict(self.retention, self.history_limit);
            let active: Vec<Arc<JobEntry>> = inner.active.values().cloned().collect();
            let rows: Vec<(u64, JobSummary)> = inner
                .history
                .iter()
                .map(|f| (f.seq, f.summary.clone()))
                .collect();
            (active, rows)
        };

        for entry in active {
            rows.push((entry.seq, entry.summary().await));
        }
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Number of jobs holding a slot.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    /// 1-based position among jobs still waiting to be submitted. `None`
    /// once the job has left `Queued`.
    pub async fn queue_position(&self, id: &JobId) -> Result<Option<usize>, CoreError> {
        let active: Vec<Arc<JobEntry>> = {
            let inner = self.inner.lock().await;
            if !inner.id_in_use(id) {
                return Err(CoreError::NotFound(id.clone()));
            }
            inner.active.values().cloned().collect()
        };

        let mut position = 0;
        for entry in active {
            if entry.state().await != JobState::Queued {
                continue;
            }
            position += 1;
            if &entry.id == id {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    async fn retire(&self, seq: u64, summary: &JobSummary) {
        let mut inner = self.inner.lock().await;
        inner.active.shift_remove(&summary.id);
        inner.history.push_back(Finished {
            seq,
            at: Instant::now(),
            summary: summary.clone(),
        });
        inner.evict(self.retention, self.history_limit);
        tracing::debug!(
            job_id = %summary.id,
            state = %summary.state,
            active = inner.active.len(),
            retained = inner.history.len(),
            "Job left the active set",
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
