//! Wires the queue, provider adapters, polling engine and download manager
//! into one running service.
//!
//! [`Orchestrator::start`] spawns three long-lived tasks (dispatcher,
//! poller, download loop) that all stop when [`Orchestrator::shutdown`]
//! cancels the master token. Per-job work (one submission, one download)
//! runs in short-lived tasks so jobs never wait on each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vidgen_core::backoff::{next_delay, PollSchedule, RetryBackoff};
use vidgen_core::{
    Capabilities, CoreError, EngineConfig, GenerationRequest, Job, JobFailure, JobId, JobSummary,
    RemoteHandle,
};
use vidgen_providers::{ModelInfo, ModelRegistry, RegisteredModel};

use crate::download::{DownloadError, DownloadManager, RangeSource};
use crate::events::{EventBus, JobEvent};
use crate::polling::{DownloadOrder, PollingEngine, TrackRequest};
use crate::queue::{CancelScope, JobEntry, QueueManager};

/// How long shutdown waits for each background task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a per-job task needs, cheap to clone.
#[derive(Clone)]
struct Workers {
    queue: Arc<QueueManager>,
    downloads: Arc<DownloadManager>,
    download_dir: PathBuf,
    track_tx: mpsc::UnboundedSender<TrackRequest>,
    download_tx: mpsc::UnboundedSender<DownloadOrder>,
    submit_retries: u32,
    backoff: RetryBackoff,
}

/// The running job engine.
pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    queue: Arc<QueueManager>,
    events: Arc<EventBus>,
    dispatch_tx: mpsc::UnboundedSender<Arc<JobEntry>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Start the engine with the default retry backoff.
    pub fn start(
        config: EngineConfig,
        registry: Arc<ModelRegistry>,
        source: Arc<dyn RangeSource>,
    ) -> Arc<Self> {
        Self::start_with_backoff(config, registry, source, RetryBackoff::default())
    }

    /// Start the engine; `backoff` spaces submit and download retries.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with_backoff(
        config: EngineConfig,
        registry: Arc<ModelRegistry>,
        source: Arc<dyn RangeSource>,
        backoff: RetryBackoff,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let events = Arc::new(EventBus::default());
        let queue = Arc::new(QueueManager::new(&config, Arc::clone(&events), cancel.clone()));

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let (download_tx, download_rx) = mpsc::unbounded_channel();

        let workers = Workers {
            queue: Arc::clone(&queue),
            downloads: Arc::new(DownloadManager::new(source, &config).with_backoff(backoff)),
            download_dir: config.download_dir.clone(),
            track_tx,
            download_tx: download_tx.clone(),
            submit_retries: config.submit_retries,
            backoff,
        };
        let poller = PollingEngine::new(
            Arc::clone(&queue),
            PollSchedule::from_config(&config),
            download_tx,
        );

        let tasks = vec![
            (
                "dispatcher",
                tokio::spawn(run_dispatcher(dispatch_rx, workers.clone(), cancel.clone())),
            ),
            ("poller", tokio::spawn(poller.run(track_rx, cancel.clone()))),
            (
                "downloader",
                tokio::spawn(run_downloader(download_rx, workers, cancel.clone())),
            ),
        ];

        tracing::info!(
            max_queue_size = config.max_queue_size,
            task_timeout_secs = config.task_timeout.as_secs(),
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            download_dir = %config.download_dir.display(),
            "Orchestrator started",
        );

        Arc::new(Self {
            registry,
            queue,
            events,
            dispatch_tx,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    // ---- jobs ----

    /// Admit a request and hand it to the dispatcher.
    ///
    /// The model is resolved now and stays bound to the job even if the
    /// default changes before the job is submitted. Fails with
    /// `ShuttingDown` once [`shutdown`](Self::shutdown) has started.
    pub async fn submit(&self, request: GenerationRequest) -> Result<JobId, CoreError> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }
        let model = self.registry.resolve(request.model.as_deref()).await?;
        let entry = self.queue.submit(request, model).await?;
        let id = entry.id.clone();
        if let Err(mpsc::error::SendError(entry)) = self.dispatch_tx.send(entry) {
            tracing::error!(job_id = %id, "Dispatcher stopped, job will not be submitted");
            self.queue.update(&entry, Job::mark_cancelled).await;
            return Err(CoreError::ShuttingDown);
        }
        Ok(id)
    }

    /// Cancel a job. A remote task, if one exists, is cancelled best-effort
    /// in the background; the local state is `Cancelled` either way.
    pub async fn cancel(&self, id: &JobId, scope: &CancelScope) -> Result<JobSummary, CoreError> {
        let outcome = self.queue.cancel(id, scope).await?;
        if let Some(handle) = outcome.remote {
            spawn_remote_cancel(&outcome.model, handle);
        }
        Ok(outcome.summary)
    }

    pub async fn status(&self, id: &JobId) -> Result<JobSummary, CoreError> {
        self.queue.status(id).await
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        self.queue.list().await
    }

    pub async fn active_count(&self) -> usize {
        self.queue.active_count().await
    }

    pub async fn queue_position(&self, id: &JobId) -> Result<Option<usize>, CoreError> {
        self.queue.queue_position(id).await
    }

    // ---- models ----

    /// `None` or `"default"` resolves the current default model.
    pub async fn resolve(&self, model_id: Option<&str>) -> Result<Arc<RegisteredModel>, CoreError> {
        self.registry.resolve(model_id).await
    }

    pub async fn set_default(&self, model_id: &str) -> Result<(), CoreError> {
        self.registry.set_default(model_id).await
    }

    pub async fn capabilities(&self, model_id: &str) -> Result<Capabilities, CoreError> {
        self.registry.capabilities(model_id).await
    }

    pub async fn models(&self) -> Vec<ModelInfo> {
        self.registry.list().await
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Receive every job lifecycle event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Cancel every active job, then every background task, waiting up to
    /// 5 seconds for each task.
    ///
    /// New submissions are refused from the first step on. In-flight
    /// downloads are abandoned and their partial files removed.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down orchestrator");
        let outcomes = self.queue.close().await;
        for outcome in outcomes {
            if let Some(handle) = outcome.remote {
                spawn_remote_cancel(&outcome.model, handle);
            }
        }
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for (name, handle) in tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!(task = name, "Task did not stop in time");
            }
        }

        tracing::info!("Orchestrator shut down complete");
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Arc<JobEntry>>,
    workers: Workers,
    cancel: CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        tokio::spawn(submit_job(workers.clone(), entry));
    }
    tracing::debug!("Dispatcher stopped");
}

async fn run_downloader(
    mut rx: mpsc::UnboundedReceiver<DownloadOrder>,
    workers: Workers,
    cancel: CancellationToken,
) {
    loop {
        let order = tokio::select! {
            _ = cancel.cancelled() => break,
            order = rx.recv() => match order {
                Some(order) => order,
                None => break,
            },
        };
        tokio::spawn(download_job(workers.clone(), order));
    }
    tracing::debug!("Download loop stopped");
}

// ---------------------------------------------------------------------------
// Per-job tasks
// ---------------------------------------------------------------------------

/// `Queued -> Submitted -> Polling`, retrying transient provider errors.
async fn submit_job(workers: Workers, entry: Arc<JobEntry>) {
    if entry.cancel.is_cancelled() || !workers.queue.update(&entry, Job::mark_submitted).await {
        return;
    }
    let submitted_at = Instant::now();
    let job = entry.snapshot().await;
    let adapter = Arc::clone(&entry.model.adapter);
    let mut failures = 0u32;
    let mut delay = workers.backoff.initial_delay;

    loop {
        if entry.cancel.is_cancelled() {
            return;
        }
        match adapter.submit(&job).await {
            Ok(handle) => {
                let accepted = !entry.cancel.is_cancelled()
                    && workers
                        .queue
                        .update(&entry, |j| j.mark_polling(handle.clone()))
                        .await;
                if !accepted {
                    tracing::info!(
                        job_id = %entry.id,
                        task_id = %handle.task_id,
                        "Job cancelled during submission, abandoning remote task",
                    );
                    spawn_remote_cancel(&entry.model, handle);
                    return;
                }

                tracing::info!(
                    job_id = %entry.id,
                    model_id = %entry.model.id,
                    task_id = %handle.task_id,
                    retries = failures,
                    "Job submitted to provider",
                );
                match handle.ready.clone() {
                    Some(result) => {
                        let ready = workers
                            .queue
                            .update(&entry, |j| j.mark_downloading(result.clone()))
                            .await;
                        if !ready {
                            return;
                        }
                        if let Err(mpsc::error::SendError(order)) =
                            workers.download_tx.send(DownloadOrder { entry, result })
                        {
                            tracing::error!(job_id = %order.entry.id, "Download queue closed, result dropped");
                            abort(&workers, &order.entry, "download queue closed").await;
                        }
                    }
                    None => {
                        if let Err(mpsc::error::SendError(request)) =
                            workers.track_tx.send(TrackRequest {
                                entry,
                                handle,
                                submitted_at,
                            })
                        {
                            tracing::error!(job_id = %request.entry.id, "Poller stopped, remote task untracked");
                            abort(&workers, &request.entry, "poller stopped").await;
                            spawn_remote_cancel(&request.entry.model, request.handle);
                        }
                    }
                }
                return;
            }
            Err(e) if e.is_transient() && failures < workers.submit_retries => {
                failures += 1;
                tracing::warn!(
                    job_id = %entry.id,
                    attempt = failures,
                    retries = workers.submit_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Submit failed, retrying",
                );
                workers
                    .queue
                    .update(&entry, |j| {
                        j.record_retry();
                        Ok(())
                    })
                    .await;
                tokio::select! {
                    _ = entry.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_delay(delay, &workers.backoff);
            }
            Err(e) => {
                tracing::warn!(job_id = %entry.id, error = %e, transient = e.is_transient(), "Submit failed");
                workers
                    .queue
                    .update(&entry, |j| j.mark_failed(JobFailure::Provider(e.to_string())))
                    .await;
                return;
            }
        }
    }
}

/// `Downloading -> Completed | Failed`.
async fn download_job(workers: Workers, order: DownloadOrder) {
    let DownloadOrder { entry, result } = order;
    if entry.cancel.is_cancelled() {
        return;
    }

    match workers
        .downloads
        .fetch(&entry.id, &result, &workers.download_dir, &entry.cancel)
        .await
    {
        Ok(artifact) => {
            let path = artifact.path.clone();
            let completed = workers
                .queue
                .update(&entry, |j| j.mark_completed(artifact.path, artifact.bytes))
                .await;
            if !completed {
                tracing::info!(job_id = %entry.id, "Job finished elsewhere, removing artifact");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(job_id = %entry.id, error = %e, "Failed to remove artifact");
                }
            }
        }
        Err(DownloadError::Cancelled) => {
            tracing::debug!(job_id = %entry.id, "Download abandoned");
        }
        Err(e) => {
            tracing::warn!(job_id = %entry.id, url = %result.url, error = %e, "Download failed");
            workers
                .queue
                .update(&entry, |j| j.mark_failed(JobFailure::Download(e.to_string())))
                .await;
        }
    }
}

/// Fail a job whose next stage can no longer receive it.
async fn abort(workers: &Workers, entry: &JobEntry, reason: &str) {
    workers
        .queue
        .update(entry, |j| j.mark_failed(JobFailure::Aborted(reason.to_string())))
        .await;
}

/// Fire-and-forget remote cancellation.
fn spawn_remote_cancel(model: &RegisteredModel, handle: RemoteHandle) {
    let adapter = Arc::clone(&model.adapter);
    let model_id = model.id.clone();
    tokio::spawn(async move {
        match adapter.cancel(&handle).await {
            Ok(true) => {
                tracing::info!(model_id = %model_id, task_id = %handle.task_id, "Remote task cancelled")
            }
            Ok(false) => {
                tracing::debug!(model_id = %model_id, task_id = %handle.task_id, "Provider has no remote cancel")
            }
            Err(e) => {
                tracing::warn!(model_id = %model_id, task_id = %handle.task_id, error = %e, "Remote cancel failed")
            }
        }
    });
}
