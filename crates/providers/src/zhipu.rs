//! Zhipu CogVideoX adapter.

use async_trait::async_trait;
use serde_json::{json, Value};
use vidgen_core::{Job, Mode, ProviderFormat, RemoteHandle, Resolution, ResultRef};

use crate::adapter::{effective_prompt, prompt_preview, AdapterSettings, ProviderAdapter, RemoteStatus};
use crate::error::ProviderError;
use crate::http::{first_str, ProviderHttp};

const ENDPOINT_CREATE: &str = "/paas/v4/videos/generations";
const ENDPOINT_RESULT: &str = "/paas/v4/async-result";

pub struct ZhipuAdapter {
    http: ProviderHttp,
    settings: AdapterSettings,
}

impl ZhipuAdapter {
    pub fn new(http: ProviderHttp, settings: AdapterSettings) -> Self {
        tracing::info!(base_url = http.base_url(), model = %settings.provider_model, "Zhipu adapter ready");
        Self { http, settings }
    }
}

/// `WxH` size string. 480p is not offered and maps to 1080p.
fn size(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::P720 => "1280x720",
        Resolution::K4 => "3840x2160",
        Resolution::P1080 | Resolution::P480 => "1920x1080",
    }
}

/// Build the video-generation request body.
///
/// `image_url` is a single string for the opening frame and a two-element
/// array for first/last-frame generation. The API has no way to anchor only
/// the closing frame.
pub fn build_submit_body(job: &Job, settings: &AdapterSettings) -> Result<Value, ProviderError> {
    let mut body = json!({
        "model": settings.provider_model,
        "prompt": effective_prompt(job),
        "size": size(job.params.resolution),
        "fps": job.params.fps,
        "duration": job.params.duration_secs,
        "with_audio": job.music.is_some(),
        "quality": "speed",
        "watermark_enabled": settings.watermark,
        "request_id": job.id.as_str(),
    });

    match job.mode {
        Mode::TextToVideo => {}
        Mode::FirstFrame => {
            if let Some(img) = job.images.first() {
                body["image_url"] = json!(img.as_str());
            }
        }
        Mode::LastFrame => {
            return Err(ProviderError::permanent(
                "CogVideoX cannot generate from a last frame alone",
            ));
        }
        Mode::FirstLastFrame => {
            let urls: Vec<&str> = job.images.iter().map(|i| i.as_str()).collect();
            body["image_url"] = json!(urls);
        }
    }
    Ok(body)
}

/// Map an async-result response onto [`RemoteStatus`].
pub fn parse_status(body: &Value) -> Result<RemoteStatus, ProviderError> {
    let status = body
        .get("task_status")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    match status {
        "PROCESSING" => Ok(RemoteStatus::Running { progress: Some(50) }),
        "SUCCESS" => match first_str(body, &["/video_result/0/url"]) {
            Some(url) => Ok(RemoteStatus::Succeeded(ResultRef::new(url))),
            None => Ok(RemoteStatus::Failed(
                "task succeeded without a video URL".to_string(),
            )),
        },
        "FAIL" => Ok(RemoteStatus::Failed(
            first_str(body, &["/message", "/error/message"])
                .unwrap_or("generation failed")
                .to_string(),
        )),
        other => Err(ProviderError::transient(format!(
            "unrecognized task status '{other}'"
        ))),
    }
}

#[async_trait]
impl ProviderAdapter for ZhipuAdapter {
    fn format(&self) -> ProviderFormat {
        ProviderFormat::Zhipu
    }

    async fn submit(&self, job: &Job) -> Result<RemoteHandle, ProviderError> {
        let body = build_submit_body(job, &self.settings)?;
        tracing::info!(
            job_id = %job.id,
            model = %self.settings.provider_model,
            mode = %job.mode,
            prompt = %prompt_preview(&job.prompt),
            "Creating Zhipu task",
        );

        let response = self.http.post_json(ENDPOINT_CREATE, &body, &[]).await?;
        let task_id = first_str(&response, &["/id"]).ok_or_else(|| {
            ProviderError::permanent(format!("no task id in response: {response}"))
        })?;

        tracing::info!(
            job_id = %job.id,
            task_id,
            task_status = first_str(&response, &["/task_status"]).unwrap_or(""),
            "Zhipu task created",
        );
        Ok(RemoteHandle::new(task_id))
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ProviderError> {
        let body = self
            .http
            .get_json(&format!("{ENDPOINT_RESULT}/{}", handle.task_id))
            .await?;
        parse_status(&body)
    }
}
