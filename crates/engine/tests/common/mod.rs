//! Shared fixtures for engine integration tests: a scripted provider
//! adapter, an in-memory range source and helpers for waiting on jobs.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;
use vidgen_core::backoff::RetryBackoff;
use vidgen_core::{
    EngineConfig, Job, JobId, JobState, JobSummary, ModelConfig, ProviderFormat, RemoteHandle,
};
use vidgen_engine::{BodyKind, Orchestrator, RangeBody, RangeSource, TransferError};
use vidgen_providers::{ModelRegistry, ProviderAdapter, ProviderError, RemoteStatus};

// ---------------------------------------------------------------------------
// Mock adapter
// ---------------------------------------------------------------------------

/// Provider adapter that replays scripted answers and records every call.
///
/// Once a script runs dry, `submit` hands out `task-<n>` handles and
/// `status` answers `Running`.
pub struct MockAdapter {
    format: ProviderFormat,
    submits: Mutex<VecDeque<Result<RemoteHandle, ProviderError>>>,
    statuses: Mutex<VecDeque<Result<RemoteStatus, ProviderError>>>,
    submit_delay: Duration,
    status_delay: Duration,
    pub submitted: Mutex<Vec<(Instant, Job)>>,
    pub polls: Mutex<Vec<Instant>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new(format: ProviderFormat) -> Self {
        Self {
            format,
            submits: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            submit_delay: Duration::ZERO,
            status_delay: Duration::ZERO,
            submitted: Mutex::new(Vec::new()),
            polls: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn with_submits(self, script: Vec<Result<RemoteHandle, ProviderError>>) -> Self {
        *self.submits.lock().unwrap() = script.into();
        self
    }

    pub fn with_statuses(self, script: Vec<Result<RemoteStatus, ProviderError>>) -> Self {
        *self.statuses.lock().unwrap() = script.into();
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn submitted_jobs(&self) -> Vec<Job> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, job)| job.clone())
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.lock().unwrap().len()
    }

    pub fn poll_times(&self) -> Vec<Instant> {
        self.polls.lock().unwrap().clone()
    }

    pub fn cancelled_tasks(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn format(&self) -> ProviderFormat {
        self.format
    }

    async fn submit(&self, job: &Job) -> Result<RemoteHandle, ProviderError> {
        let n = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push((Instant::now(), job.clone()));
            submitted.len()
        };
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        let scripted = self.submits.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(RemoteHandle::new(format!("task-{n}"))))
    }

    async fn status(&self, _handle: &RemoteHandle) -> Result<RemoteStatus, ProviderError> {
        self.polls.lock().unwrap().push(Instant::now());
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        let scripted = self.statuses.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(RemoteStatus::Running { progress: None }))
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, ProviderError> {
        self.cancelled.lock().unwrap().push(handle.task_id.clone());
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// In-memory range source
// ---------------------------------------------------------------------------

/// Serves one payload for every URL, honouring `Range` offsets.
pub struct MemorySource {
    data: Vec<u8>,
    chunk: usize,
    chunk_delay: Duration,
    /// Bodies still to cut short, and after how many chunks.
    interruptions: Mutex<u32>,
    cut_after: usize,
    reject: Option<u16>,
    offsets: Mutex<Vec<u64>>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>, chunk: usize) -> Self {
        Self {
            data,
            chunk,
            chunk_delay: Duration::ZERO,
            interruptions: Mutex::new(0),
            cut_after: 1,
            reject: None,
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn interrupted(mut self, times: u32, cut_after: usize) -> Self {
        self.interruptions = Mutex::new(times);
        self.cut_after = cut_after;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn rejecting(mut self, status: u16) -> Self {
        self.reject = Some(status);
        self
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn open(&self, _url: &str, offset: u64) -> Result<RangeBody, TransferError> {
        self.offsets.lock().unwrap().push(offset);
        if let Some(status) = self.reject {
            return Err(TransferError::Rejected {
                status,
                message: "Forbidden".into(),
            });
        }

        let total = self.data.len() as u64;
        if offset >= total && offset > 0 {
            return Err(TransferError::RangeNotSatisfiable { total: Some(total) });
        }
        let kind = if offset == 0 {
            BodyKind::Full
        } else {
            BodyKind::Partial
        };

        let mut items: Vec<Result<Vec<u8>, TransferError>> = self.data[offset as usize..]
            .chunks(self.chunk)
            .map(|c| Ok(c.to_vec()))
            .collect();
        {
            let mut left = self.interruptions.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                items.truncate(self.cut_after);
                items.push(Err(TransferError::Interrupted("connection reset".into())));
            }
        }

        let delay = self.chunk_delay;
        let chunks = futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed();
        Ok(RangeBody {
            kind,
            total: Some(total),
            chunks,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Millisecond-scale engine settings writing into `dir`.
pub fn fast_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        max_queue_size: 10,
        task_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
        max_poll_interval: Duration::from_millis(50),
        poll_backoff_factor: 1.5,
        download_dir: dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

pub fn fast_backoff() -> RetryBackoff {
    RetryBackoff {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

/// Registry with one mock-backed model. `provider_model` picks the
/// catalog entry and therefore the capabilities.
pub async fn registry_with(
    id: &str,
    provider_model: &str,
    adapter: Arc<MockAdapter>,
) -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new());
    register(&registry, id, provider_model, adapter).await;
    registry
}

pub async fn register(
    registry: &ModelRegistry,
    id: &str,
    provider_model: &str,
    adapter: Arc<MockAdapter>,
) {
    let config = ModelConfig::new(adapter.format, provider_model);
    registry
        .register_adapter(id, config, adapter)
        .await
        .expect("mock model registers");
}

pub fn start(
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    source: Arc<MemorySource>,
) -> Arc<Orchestrator> {
    Orchestrator::start_with_backoff(config, registry, source, fast_backoff())
}

/// Poll `status` until `done` holds, panicking after `limit`.
pub async fn wait_until<F>(
    orch: &Orchestrator,
    id: &JobId,
    limit: Duration,
    done: F,
) -> JobSummary
where
    F: Fn(&JobSummary) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        let summary = orch.status(id).await.expect("job is known");
        if done(&summary) {
            return summary;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {} after {limit:?}",
            summary.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(
    orch: &Orchestrator,
    id: &JobId,
    state: JobState,
) -> JobSummary {
    wait_until(orch, id, Duration::from_secs(5), |s| s.state == state).await
}

pub async fn wait_for_terminal(orch: &Orchestrator, id: &JobId) -> JobSummary {
    wait_until(orch, id, Duration::from_secs(5), |s| s.state.is_terminal()).await
}
