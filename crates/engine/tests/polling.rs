//! Poll cadence, timeout and remote failure handling, driven on a paused
//! clock so the schedule can be asserted to the millisecond.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio::time::Instant;
use vidgen_core::{EngineConfig, GenerationRequest, JobState, ProviderFormat};
use vidgen_engine::Orchestrator;
use vidgen_providers::{ProviderError, RemoteStatus};

const MODEL: &str = "doubao-seedance-1-5-pro-251215";

fn paused_config(timeout_secs: u64) -> EngineConfig {
    EngineConfig {
        task_timeout: Duration::from_secs(timeout_secs),
        poll_interval: Duration::from_secs(5),
        max_poll_interval: Duration::from_secs(30),
        poll_backoff_factor: 1.5,
        download_dir: std::env::temp_dir().join("vidgen-polling-tests"),
        ..EngineConfig::default()
    }
}

fn running() -> Result<RemoteStatus, ProviderError> {
    Ok(RemoteStatus::Running { progress: None })
}

/// Gaps between successive polls, in seconds.
fn gaps(times: &[Instant]) -> Vec<f64> {
    times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs_f64())
        .collect()
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "gaps {actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 0.005, "gaps {actual:?} vs {expected:?}");
    }
}

// ---------------------------------------------------------------------------
// Test: intervals grow by the factor and cap at the max
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn poll_intervals_back_off_to_the_cap() {
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", MODEL, Arc::clone(&adapter)).await;
    let orch = Orchestrator::start_with_backoff(
        paused_config(600),
        registry,
        Arc::new(MemorySource::new(payload(16), 16)),
        fast_backoff(),
    );

    let id = orch
        .submit(GenerationRequest::text("u1", "a lighthouse at dusk"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(127)).await;

    let submitted_at = adapter.submitted.lock().unwrap()[0].0;
    let polls = adapter.poll_times();
    assert!(polls.len() >= 7, "only {} polls", polls.len());

    let first = (polls[0] - submitted_at).as_secs_f64();
    assert!((first - 5.0).abs() < 0.005, "first poll after {first}s");
    assert_close(
        &gaps(&polls[..7]),
        &[7.5, 11.25, 16.875, 25.3125, 30.0, 30.0],
    );

    let summary = orch.status(&id).await.unwrap();
    assert_eq!(summary.state, JobState::Polling);
    assert_eq!(summary.poll_count as usize, adapter.poll_count());

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: an answer after a transient error resets to the base interval
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn answer_after_transient_error_resets_interval() {
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine).with_statuses(vec![
        running(),
        running(),
        Err(ProviderError::transient("upstream 503")),
        running(),
    ]));
    let registry = registry_with("seedance", MODEL, Arc::clone(&adapter)).await;
    let orch = Orchestrator::start_with_backoff(
        paused_config(600),
        registry,
        Arc::new(MemorySource::new(payload(16), 16)),
        fast_backoff(),
    );

    let id = orch
        .submit(GenerationRequest::text("u1", "a lighthouse at dusk"))
        .await
        .unwrap();
    // 5 + 7.5 + 11.25 + 16.875 + 5 = 45.625
    tokio::time::sleep(Duration::from_secs(46)).await;

    let polls = adapter.poll_times();
    assert!(polls.len() >= 5, "only {} polls", polls.len());
    assert_close(&gaps(&polls[..5]), &[7.5, 11.25, 16.875, 5.0]);

    let summary = orch.status(&id).await.unwrap();
    assert_eq!(summary.retry_count, 1);
    assert_eq!(summary.state, JobState::Polling);

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn job_times_out_at_deadline() {
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine));
    let registry = registry_with("seedance", MODEL, Arc::clone(&adapter)).await;
    let orch = Orchestrator::start_with_backoff(
        paused_config(60),
        registry,
        Arc::new(MemorySource::new(payload(16), 16)),
        fast_backoff(),
    );

    let id = orch
        .submit(GenerationRequest::text("u1", "a lighthouse at dusk"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(59_500)).await;
    assert_eq!(orch.status(&id).await.unwrap().state, JobState::Polling);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let summary = orch.status(&id).await.unwrap();
    assert_eq!(summary.state, JobState::Failed);
    assert_eq!(summary.failure.as_deref(), Some("timed out after 60s"));
    // Polls at 5, 12.5, 23.75 and 40.625; the next would land past the deadline.
    assert_eq!(summary.poll_count, 4);
    assert_eq!(orch.active_count().await, 0);

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_while_status_check_hangs() {
    let adapter = Arc::new(
        MockAdapter::new(ProviderFormat::Volcengine).with_status_delay(Duration::from_secs(100)),
    );
    let registry = registry_with("seedance", MODEL, Arc::clone(&adapter)).await;
    let orch = Orchestrator::start_with_backoff(
        paused_config(60),
        registry,
        Arc::new(MemorySource::new(payload(16), 16)),
        fast_backoff(),
    );

    let id = orch
        .submit(GenerationRequest::text("u1", "a lighthouse at dusk"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let summary = orch.status(&id).await.unwrap();
    assert_eq!(summary.state, JobState::Failed);
    assert_eq!(summary.failure.as_deref(), Some("timed out after 60s"));
    assert_eq!(adapter.poll_count(), 1);
    assert_eq!(summary.poll_count, 0);

    // The hung answer arrives later and changes nothing.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(orch.status(&id).await.unwrap(), summary);

    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: remote and provider failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn remote_failure_fails_the_job() {
    let adapter = Arc::new(MockAdapter::new(ProviderFormat::Volcengine).with_statuses(vec![
        running(),
        Ok(RemoteStatus::Failed("content policy violation".into())),
    ]));
    let registry = registry_with("seedance", MODEL, Arc::clone(&adapter)).await;
    let orch = Orchestrator::start_with_backoff(
        paused_config(600),
        registry,
        Arc::new(MemorySource::new(payload(16), 16)),
        fast_backoff(),
    );

    let id = orch
        .submit(GenerationRequest::text("u1", "a lighthouse at dusk"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let summary = orch.status(&id).await.unwrap();
    assert_eq!(summary.state, JobState::Failed);
    assert_eq!(
        summary.failure.as_deref(),
        Some("generation failed: content policy violation")
    );
    assert_eq!(summary.poll_count, 2);
    assert_eq!(adapter.poll_count(), 2);

    orch.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn permanent_status_error_fails_the_job() {
    let adapter = Arc::new(
        MockAdapter::new(ProviderFormat::Volcengine)
            .with_statuses(vec![Err(ProviderError::permanent("task not found"))]),
    );
    let registry = registry_with("seedance", MODEL, Arc::clone(&adapter)).await;
    let orch = Orchestrator::start_with_backoff(
        paused_config(600),
        registry,
        Arc::new(MemorySource::new(payload(16), 16)),
        fast_backoff(),
    );

    let id = orch
        .submit(GenerationRequest::text("u1", "a lighthouse at dusk"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let summary = orch.status(&id).await.unwrap();
    assert_eq!(summary.state, JobState::Failed);
    let failure = summary.failure.unwrap();
    assert!(failure.starts_with("provider error"), "{failure}");
    assert!(failure.contains("task not found"), "{failure}");
    assert_eq!(adapter.poll_count(), 1);

    orch.shutdown().await;
}
