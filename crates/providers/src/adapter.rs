//! The adapter trait every provider family implements.

use async_trait::async_trait;
use vidgen_core::{Job, ModelConfig, ProviderFormat, RemoteHandle, ResultRef};

use crate::error::ProviderError;

/// Canonical remote status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Queued or generating on the provider side.
    Running { progress: Option<u8> },
    Succeeded(ResultRef),
    /// The provider gave up on the generation itself.
    Failed(String),
}

/// Translator between a canonical [`Job`] and one remote API.
///
/// Implementations hold no per-job state; the engine guarantees at most
/// one outstanding call per job.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn format(&self) -> ProviderFormat;

    /// Create the remote task. A handle with `ready` set means the provider
    /// answered synchronously with the finished artifact.
    async fn submit(&self, job: &Job) -> Result<RemoteHandle, ProviderError>;

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ProviderError>;

    /// Best-effort remote cancellation. Returns `Ok(false)` when the
    /// provider has no cancel endpoint.
    async fn cancel(&self, _handle: &RemoteHandle) -> Result<bool, ProviderError> {
        Ok(false)
    }
}

/// Per-model settings every adapter needs at submit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Provider-side model identifier.
    pub provider_model: String,
    pub watermark: bool,
    pub prompt_extend: bool,
}

impl AdapterSettings {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            provider_model: config.model.trim().to_string(),
            watermark: config.watermark,
            prompt_extend: config.prompt_extend,
        }
    }
}

/// Prompt text sent to the provider. A requested music style is appended
/// as a hint since no provider takes style or volume as parameters.
pub fn effective_prompt(job: &Job) -> String {
    match &job.music {
        Some(music) if music.style.is_some() => {
            format!("{}, {}", job.prompt, music.prompt_hint())
        }
        _ => job.prompt.clone(),
    }
}

/// Short prompt preview for logs.
pub fn prompt_preview(prompt: &str) -> String {
    const PREVIEW_CHARS: usize = 50;
    if prompt.chars().count() <= PREVIEW_CHARS {
        prompt.to_string()
    } else {
        let head: String = prompt.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}
