//! `vidgen-worker` -- standalone video-generation job engine.
//!
//! Loads engine settings from the environment, registers the models listed
//! in `MODELS_FILE`, and runs the orchestrator until Ctrl-C. Each line on
//! stdin is read as a JSON generation request and submitted; lifecycle
//! events are logged as they happen.
//!
//! See `EngineConfig::from_env` for the full list of variables.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidgen_core::config::load_models_file;
use vidgen_core::{EngineConfig, GenerationRequest, JobState};
use vidgen_engine::{HttpRangeSource, Orchestrator};
use vidgen_providers::ModelRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidgen_worker=info,vidgen_engine=info,vidgen_providers=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let registry = Arc::new(load_registry(&config).await?);

    let orchestrator = Orchestrator::start(
        config,
        Arc::clone(&registry),
        Arc::new(HttpRangeSource::default()),
    );

    let stop = CancellationToken::new();
    let event_task = tokio::spawn(log_events(Arc::clone(&orchestrator), stop.clone()));
    let input_task = tokio::spawn(read_requests(Arc::clone(&orchestrator), stop.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Ctrl-C received, stopping");

    stop.cancel();
    orchestrator.shutdown().await;
    let _ = event_task.await;
    input_task.abort();

    Ok(())
}

/// Build the model registry from `MODELS_FILE` and apply `DEFAULT_MODEL`.
async fn load_registry(config: &EngineConfig) -> anyhow::Result<ModelRegistry> {
    let registry = ModelRegistry::new();

    match &config.models_file {
        Some(path) => {
            let models = load_models_file(path)
                .with_context(|| format!("failed to load models from {}", path.display()))?;
            for (id, model) in models {
                registry
                    .register(&id, model)
                    .await
                    .with_context(|| format!("failed to register model {id}"))?;
            }
        }
        None => tracing::warn!("MODELS_FILE not set, no models registered"),
    }

    if let Some(default) = &config.default_model {
        registry
            .set_default(default)
            .await
            .with_context(|| format!("DEFAULT_MODEL {default} is not registered"))?;
    }

    let models = registry.list().await;
    for model in &models {
        tracing::info!(
            model_id = %model.id,
            format = %model.format,
            provider_model = %model.provider_model,
            default = model.is_default,
            "Model registered",
        );
    }
    if models.is_empty() {
        tracing::warn!("Every submission will fail until a model is registered");
    }

    Ok(registry)
}

/// Log every lifecycle event until `stop` fires.
async fn log_events(orchestrator: Arc<Orchestrator>, stop: CancellationToken) {
    let mut events = orchestrator.subscribe();
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match event.state {
                JobState::Failed => tracing::warn!(
                    job_id = %event.job_id,
                    requester = %event.requester,
                    model_id = %event.model_id,
                    reason = event.message.as_deref().unwrap_or(""),
                    "Job failed",
                ),
                _ => tracing::info!(
                    job_id = %event.job_id,
                    requester = %event.requester,
                    model_id = %event.model_id,
                    state = %event.state,
                    progress = event.progress,
                    message = event.message.as_deref().unwrap_or(""),
                    "Job event",
                ),
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event log fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Submit one JSON request per stdin line until EOF or `stop`.
async fn read_requests(orchestrator: Arc<Orchestrator>, stop: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: GenerationRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed request");
                continue;
            }
        };
        match orchestrator.submit(request).await {
            Ok(id) => {
                let position = orchestrator.queue_position(&id).await.ok().flatten();
                tracing::info!(job_id = %id, queue_position = ?position, "Job accepted");
            }
            Err(e) => tracing::warn!(error = %e, "Job rejected"),
        }
    }
}
