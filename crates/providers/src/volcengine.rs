//! Volcengine Ark (Seedance) adapter.
//!
//! Generation options travel inside the text prompt as `--flag value`
//! pairs. Images are separate `content` entries; `role` distinguishes the
//! first and last frame.

use async_trait::async_trait;
use serde_json::{json, Value};
use vidgen_core::{Job, Mode, ProviderFormat, RemoteHandle, ResultRef};

use crate::adapter::{effective_prompt, prompt_preview, AdapterSettings, ProviderAdapter, RemoteStatus};
use crate::error::ProviderError;
use crate::http::{extract_error_message, first_str, ProviderHttp};

const ENDPOINT_TASKS: &str = "/contents/generations/tasks";

pub struct VolcengineAdapter {
    http: ProviderHttp,
    settings: AdapterSettings,
}

impl VolcengineAdapter {
    pub fn new(http: ProviderHttp, settings: AdapterSettings) -> Self {
        tracing::info!(base_url = http.base_url(), model = %settings.provider_model, "Volcengine adapter ready");
        Self { http, settings }
    }
}

/// Build the `POST /contents/generations/tasks` body.
pub fn build_submit_body(job: &Job, settings: &AdapterSettings) -> Value {
    let first = job.images.first();
    let (first_frame, last_frame) = match job.mode {
        Mode::TextToVideo => (None, None),
        Mode::FirstFrame => (first, None),
        Mode::LastFrame => (None, first),
        Mode::FirstLastFrame => (first, job.images.get(1)),
    };

    let mut text = effective_prompt(job);
    text.push_str(&format!(
        " --resolution {} --duration {} --watermark {}",
        job.params.resolution, job.params.duration_secs, settings.watermark
    ));
    if first_frame.is_some() || last_frame.is_some() {
        text.push_str(" --ratio adaptive");
    }
    text.push_str(" --camerafixed true");

    let mut content = vec![json!({"type": "text", "text": text})];
    if let Some(img) = first_frame {
        let mut entry = json!({"type": "image_url", "image_url": {"url": img.as_str()}});
        if last_frame.is_some() {
            entry["role"] = json!("first_frame");
        }
        content.push(entry);
    }
    if let Some(img) = last_frame {
        content.push(json!({
            "type": "image_url",
            "image_url": {"url": img.as_str()},
            "role": "last_frame",
        }));
    }

    let mut body = json!({
        "model": settings.provider_model,
        "content": content,
    });
    if job.music.is_some() {
        body["generate_audio"] = json!(true);
    }
    body
}

/// Map a task query response onto [`RemoteStatus`].
pub fn parse_status(body: &Value) -> Result<RemoteStatus, ProviderError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "queued" => Ok(RemoteStatus::Running { progress: Some(10) }),
        "running" => Ok(RemoteStatus::Running { progress: Some(50) }),
        "succeeded" => match first_str(body, &["/content/video_url"]) {
            Some(url) => Ok(RemoteStatus::Succeeded(ResultRef::new(url))),
            None => Ok(RemoteStatus::Failed(
                "task succeeded without a video URL".to_string(),
            )),
        },
        "failed" => Ok(RemoteStatus::Failed(
            extract_error_message(body).unwrap_or_else(|| "generation failed".to_string()),
        )),
        "cancelled" | "canceled" => Ok(RemoteStatus::Failed(
            "task was cancelled by the provider".to_string(),
        )),
        other => Err(ProviderError::transient(format!(
            "unrecognized task status '{other}'"
        ))),
    }
}

#[async_trait]
impl ProviderAdapter for VolcengineAdapter {
    fn format(&self) -> ProviderFormat {
        ProviderFormat::Volcengine
    }

    async fn submit(&self, job: &Job) -> Result<RemoteHandle, ProviderError> {
        let body = build_submit_body(job, &self.settings);
        tracing::info!(
            job_id = %job.id,
            model = %self.settings.provider_model,
            mode = %job.mode,
            prompt = %prompt_preview(&job.prompt),
            "Creating Volcengine task",
        );

        let response = self.http.post_json(ENDPOINT_TASKS, &body, &[]).await?;
        let task_id = first_str(&response, &["/id"]).ok_or_else(|| {
            ProviderError::permanent(format!("no task id in response: {response}"))
        })?;

        tracing::info!(job_id = %job.id, task_id, "Volcengine task created");
        Ok(RemoteHandle::new(task_id))
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ProviderError> {
        let body = self
            .http
            .get_json(&format!("{ENDPOINT_TASKS}/{}", handle.task_id))
            .await?;
        parse_status(&body)
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, ProviderError> {
        self.http
            .delete(&format!("{ENDPOINT_TASKS}/{}", handle.task_id))
            .await?;
        tracing::info!(task_id = %handle.task_id, "Volcengine task cancelled");
        Ok(true)
    }
}
