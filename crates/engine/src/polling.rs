//! Single-loop status poller.
//!
//! One driver task owns every tracked job. Each pass it sleeps until the
//! earliest poll or deadline, times out overdue jobs, and launches status
//! checks that are due. Checks run as separate tasks and report back over a
//! channel, so a slow provider never delays other jobs, and a job never has
//! more than one check outstanding.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidgen_core::backoff::{PollOutcome, PollSchedule, PollStep};
use vidgen_core::{JobFailure, JobId, RemoteHandle, ResultRef};
use vidgen_providers::{ProviderError, RemoteStatus};

use crate::queue::{JobEntry, QueueManager};

/// Start tracking a job that the provider accepted.
pub struct TrackRequest {
    pub entry: Arc<JobEntry>,
    pub handle: RemoteHandle,
    /// When the job entered `Submitted`; the task timeout counts from here.
    pub submitted_at: Instant,
}

/// A remote success waiting to be downloaded.
pub struct DownloadOrder {
    pub entry: Arc<JobEntry>,
    pub result: ResultRef,
}

struct Tracked {
    entry: Arc<JobEntry>,
    handle: RemoteHandle,
    submitted_at: Instant,
    deadline: Instant,
    attempt: u32,
    last: Option<PollOutcome>,
    next_due: Instant,
    in_flight: bool,
}

type StatusReport = (JobId, Result<RemoteStatus, ProviderError>);

pub struct PollingEngine {
    queue: Arc<QueueManager>,
    schedule: PollSchedule,
    downloads: mpsc::UnboundedSender<DownloadOrder>,
}

impl PollingEngine {
    pub fn new(
        queue: Arc<QueueManager>,
        schedule: PollSchedule,
        downloads: mpsc::UnboundedSender<DownloadOrder>,
    ) -> Self {
        Self {
            queue,
            schedule,
            downloads,
        }
    }

    /// Drive polling until `shutdown` fires or the command channel closes.
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<TrackRequest>,
        shutdown: CancellationToken,
    ) {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<StatusReport>();
        let mut tracked: IndexMap<JobId, Tracked> = IndexMap::new();

        tracing::info!(
            base_ms = self.schedule.base.as_millis() as u64,
            max_ms = self.schedule.max.as_millis() as u64,
            factor = self.schedule.factor,
            timeout_secs = self.schedule.timeout.as_secs(),
            "Polling engine started",
        );

        loop {
            let wake = next_wake(&tracked);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(request) => self.track(&mut tracked, request),
                    None => break,
                },
                Some((id, outcome)) = report_rx.recv() => {
                    self.on_report(&mut tracked, id, outcome).await;
                }
                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }
            self.sweep(&mut tracked, &report_tx).await;
        }

        tracing::info!(tracked = tracked.len(), "Polling engine stopped");
    }

    fn track(&self, tracked: &mut IndexMap<JobId, Tracked>, request: TrackRequest) {
        let now = Instant::now();
        let id = request.entry.id.clone();
        let first = self.jittered(self.schedule.interval(0));
        tracing::debug!(
            job_id = %id,
            task_id = %request.handle.task_id,
            first_poll_ms = first.as_millis() as u64,
            "Tracking remote task",
        );
        tracked.insert(
            id,
            Tracked {
                deadline: request.submitted_at + self.schedule.timeout,
                entry: request.entry,
                handle: request.handle,
                submitted_at: request.submitted_at,
                attempt: 0,
                last: None,
                next_due: now + first,
                in_flight: false,
            },
        );
    }

    /// Drop cancelled jobs, fail overdue ones, launch due checks.
    async fn sweep(
        &self,
        tracked: &mut IndexMap<JobId, Tracked>,
        report_tx: &mpsc::UnboundedSender<StatusReport>,
    ) {
        let now = Instant::now();
        let mut cancelled = Vec::new();
        let mut overdue = Vec::new();

        for (id, t) in tracked.iter_mut() {
            if t.entry.cancel.is_cancelled() {
                cancelled.push(id.clone());
            } else if now >= t.deadline {
                overdue.push(id.clone());
            } else if !t.in_flight && now >= t.next_due {
                t.in_flight = true;
                spawn_check(id.clone(), t, report_tx.clone());
            }
        }

        for id in cancelled {
            tracked.shift_remove(&id);
            tracing::debug!(job_id = %id, "Stopped polling cancelled job");
        }

        let after_secs = self.schedule.timeout.as_secs();
        for id in overdue {
            let Some(t) = tracked.shift_remove(&id) else {
                continue;
            };
            tracing::warn!(
                job_id = %id,
                task_id = %t.handle.task_id,
                attempt = t.attempt,
                after_secs,
                "Remote task timed out",
            );
            self.queue
                .update(&t.entry, |job| {
                    job.mark_failed(JobFailure::Timeout { after_secs })
                })
                .await;
        }
    }

    async fn on_report(
        &self,
        tracked: &mut IndexMap<JobId, Tracked>,
        id: JobId,
        outcome: Result<RemoteStatus, ProviderError>,
    ) {
        let Some(t) = tracked.get_mut(&id) else {
            tracing::debug!(job_id = %id, "Discarding status for untracked job");
            return;
        };
        t.in_flight = false;
        if t.entry.cancel.is_cancelled() {
            tracked.shift_remove(&id);
            return;
        }

        match outcome {
            Ok(RemoteStatus::Running { progress }) => {
                let applied = self
                    .queue
                    .update(&t.entry, |job| {
                        job.record_poll(progress);
                        Ok(())
                    })
                    .await;
                if !applied {
                    tracked.shift_remove(&id);
                    return;
                }
                t.attempt = PollSchedule::next_attempt(t.attempt, t.last, PollOutcome::Running);
                t.last = Some(PollOutcome::Running);
                self.reschedule(t);
            }
            Ok(RemoteStatus::Succeeded(result)) => {
                let Some(t) = tracked.shift_remove(&id) else {
                    return;
                };
                let applied = self
                    .queue
                    .update(&t.entry, |job| {
                        job.record_poll(None);
                        job.mark_downloading(result.clone())
                    })
                    .await;
                if applied {
                    tracing::info!(job_id = %id, url = %result.url, "Remote task succeeded");
                    if let Err(mpsc::error::SendError(order)) =
                        self.downloads.send(DownloadOrder {
                            entry: t.entry,
                            result,
                        })
                    {
                        tracing::error!(job_id = %id, "Download queue closed, result dropped");
                        self.queue
                            .update(&order.entry, |job| {
                                job.mark_failed(JobFailure::Aborted("download queue closed".into()))
                            })
                            .await;
                    }
                }
            }
            Ok(RemoteStatus::Failed(reason)) => {
                let Some(t) = tracked.shift_remove(&id) else {
                    return;
                };
                tracing::warn!(job_id = %id, task_id = %t.handle.task_id, reason = %reason, "Remote task failed");
                self.queue
                    .update(&t.entry, |job| {
                        job.record_poll(None);
                        job.mark_failed(JobFailure::Remote(reason))
                    })
                    .await;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    job_id = %id,
                    task_id = %t.handle.task_id,
                    error = %e,
                    "Status check failed, will retry",
                );
                let applied = self
                    .queue
                    .update(&t.entry, |job| {
                        job.record_retry();
                        Ok(())
                    })
                    .await;
                if !applied {
                    tracked.shift_remove(&id);
                    return;
                }
                t.attempt = PollSchedule::next_attempt(t.attempt, t.last, PollOutcome::Transient);
                t.last = Some(PollOutcome::Transient);
                self.reschedule(t);
            }
            Err(e) => {
                let Some(t) = tracked.shift_remove(&id) else {
                    return;
                };
                tracing::warn!(job_id = %id, task_id = %t.handle.task_id, error = %e, "Status check failed permanently");
                self.queue
                    .update(&t.entry, |job| {
                        job.mark_failed(JobFailure::Provider(e.to_string()))
                    })
                    .await;
            }
        }
    }

    fn reschedule(&self, t: &mut Tracked) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(t.submitted_at);
        t.next_due = match self.schedule.next_step(t.attempt, elapsed) {
            PollStep::Wait(delay) => now + self.jittered(delay),
            PollStep::TimedOut => t.deadline,
        };
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.schedule.jitter <= 0.0 {
            return delay;
        }
        let sample = rand::rng().random_range(-1.0..=1.0);
        self.schedule.jittered(delay, sample)
    }
}

/// Earliest instant anything tracked needs attention.
fn next_wake(tracked: &IndexMap<JobId, Tracked>) -> Option<Instant> {
    tracked
        .values()
        .map(|t| {
            if t.in_flight {
                t.deadline
            } else {
                t.next_due.min(t.deadline)
            }
        })
        .min()
}

fn spawn_check(id: JobId, t: &Tracked, report_tx: mpsc::UnboundedSender<StatusReport>) {
    let adapter = Arc::clone(&t.entry.model.adapter);
    let handle = t.handle.clone();
    let cancel = t.entry.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            outcome = adapter.status(&handle) => {
                let _ = report_tx.send((id, outcome));
            }
        }
    });
}
