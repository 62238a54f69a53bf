//! Adapter for OpenAI-compatible video relays.
//!
//! Relays disagree on paths and response shapes, so every call walks a
//! list of candidate endpoints and only moves on when the relay answers
//! `404`. Any other error ends the walk.

use async_trait::async_trait;
use serde_json::{json, Value};
use vidgen_core::{Job, Mode, ProviderFormat, RemoteHandle, ResultRef};

use crate::adapter::{effective_prompt, prompt_preview, AdapterSettings, ProviderAdapter, RemoteStatus};
use crate::error::ProviderError;
use crate::http::{extract_error_message, first_str, progress_at, ProviderHttp};

const SUBMIT_ENDPOINTS: &[&str] = &[
    "/video/generations",
    "/videos/generations",
    "/v1/video/generations",
    "/generations/video",
];

const STATUS_PREFIXES: &[&str] = &[
    "/video/generations/",
    "/videos/generations/",
    "/v1/video/generations/",
    "/tasks/",
    "/async-result/",
];

const TASK_ID_POINTERS: &[&str] = &["/id", "/task_id", "/data/id", "/data/task_id"];
const VIDEO_URL_POINTERS: &[&str] = &[
    "/video_url",
    "/url",
    "/result/url",
    "/data/url",
    "/output/video_url",
];

/// Prefix of task ids synthesized for synchronous responses.
const SYNC_PREFIX: &str = "sync-";

pub struct OpenAiCompatibleAdapter {
    http: ProviderHttp,
    settings: AdapterSettings,
}

impl OpenAiCompatibleAdapter {
    pub fn new(http: ProviderHttp, settings: AdapterSettings) -> Self {
        tracing::info!(base_url = http.base_url(), model = %settings.provider_model, "OpenAI-compatible adapter ready");
        Self { http, settings }
    }
}

fn is_not_found(e: &ProviderError) -> bool {
    e.status() == Some(404)
}

pub fn build_submit_body(job: &Job, settings: &AdapterSettings) -> Value {
    let mut body = json!({
        "model": settings.provider_model,
        "prompt": effective_prompt(job),
        "duration": job.params.duration_secs,
        "resolution": job.params.resolution.as_str(),
        "fps": job.params.fps,
    });
    match job.mode {
        Mode::TextToVideo => {}
        Mode::FirstFrame | Mode::LastFrame => {
            if let Some(img) = job.images.first() {
                body["image"] = json!(img.as_str());
            }
        }
        Mode::FirstLastFrame => {
            let urls: Vec<&str> = job.images.iter().map(|i| i.as_str()).collect();
            body["image"] = json!(urls);
        }
    }
    body
}

/// Turn a creation response into a handle: a task id if the relay queued
/// the job, or a ready handle if it answered with the video directly.
pub fn handle_from_response(job: &Job, response: &Value) -> Option<RemoteHandle> {
    if let Some(task_id) = first_str(response, TASK_ID_POINTERS) {
        return Some(RemoteHandle::new(task_id));
    }
    first_str(response, VIDEO_URL_POINTERS).map(|url| RemoteHandle {
        task_id: format!("{SYNC_PREFIX}{}", job.id),
        ready: Some(ResultRef::new(url)),
    })
}

/// Normalize a free-form status response.
pub fn parse_status(body: &Value) -> Result<RemoteStatus, ProviderError> {
    let word = first_str(body, &["/status", "/task_status", "/state"])
        .unwrap_or("unknown")
        .to_ascii_lowercase();
    match word.as_str() {
        "success" | "succeeded" | "completed" | "done" => {
            match first_str(body, VIDEO_URL_POINTERS) {
                Some(url) => Ok(RemoteStatus::Succeeded(ResultRef::new(url))),
                None => Ok(RemoteStatus::Failed(
                    "task succeeded without a video URL".to_string(),
                )),
            }
        }
        "queued" | "waiting" | "pending" | "processing" | "running" | "in_progress" => {
            Ok(RemoteStatus::Running {
                progress: progress_at(body, "/progress"),
            })
        }
        "failed" | "fail" | "error" | "cancelled" | "canceled" => Ok(RemoteStatus::Failed(
            first_str(body, &["/error_message"])
                .map(str::to_string)
                .or_else(|| extract_error_message(body))
                .unwrap_or_else(|| format!("task {word}")),
        )),
        other => Err(ProviderError::transient(format!(
            "unrecognized task status '{other}'"
        ))),
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn format(&self) -> ProviderFormat {
        ProviderFormat::OpenAiCompatible
    }

    async fn submit(&self, job: &Job) -> Result<RemoteHandle, ProviderError> {
        let body = build_submit_body(job, &self.settings);
        tracing::info!(
            job_id = %job.id,
            model = %self.settings.provider_model,
            mode = %job.mode,
            prompt = %prompt_preview(&job.prompt),
            "Creating OpenAI-compatible task",
        );

        let mut last_error = None;
        for endpoint in SUBMIT_ENDPOINTS {
            match self.http.post_json(endpoint, &body, &[]).await {
                Ok(response) => {
                    if let Some(handle) = handle_from_response(job, &response) {
                        tracing::info!(
                            job_id = %job.id,
                            endpoint,
                            task_id = %handle.task_id,
                            synchronous = handle.ready.is_some(),
                            "OpenAI-compatible task created",
                        );
                        return Ok(handle);
                    }
                    tracing::warn!(job_id = %job.id, endpoint, "Response carried no task id or video URL");
                    last_error = Some(ProviderError::permanent(format!(
                        "no task id in response from {endpoint}"
                    )));
                }
                Err(e) if is_not_found(&e) => {
                    tracing::debug!(endpoint, "Endpoint not found, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no endpoints configured".to_string());
        Err(ProviderError::permanent(format!(
            "no generation endpoint accepted the request: {detail}"
        )))
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ProviderError> {
        if let Some(ready) = &handle.ready {
            return Ok(RemoteStatus::Succeeded(ready.clone()));
        }
        for prefix in STATUS_PREFIXES {
            match self.http.get_json(&format!("{prefix}{}", handle.task_id)).await {
                Ok(body) => return parse_status(&body),
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ProviderError::Permanent {
            status: Some(404),
            message: format!("no status endpoint knows task {}", handle.task_id),
        })
    }

    async fn cancel(&self, handle: &RemoteHandle) -> Result<bool, ProviderError> {
        if handle.ready.is_some() {
            return Ok(false);
        }
        let id = &handle.task_id;
        match self.http.delete(&format!("/video/generations/{id}")).await {
            Ok(()) => return Ok(true),
            Err(e) if !is_not_found(&e) => return Err(e),
            Err(_) => {}
        }
        for path in [
            format!("/videos/generations/{id}/cancel"),
            format!("/tasks/{id}/cancel"),
        ] {
            match self.http.post_json(&path, &json!({}), &[]).await {
                Ok(_) => return Ok(true),
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}
