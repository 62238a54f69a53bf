//! Aliyun DashScope (Wanxiang) adapter.
//!
//! Task creation must carry `X-DashScope-Async: enable`; without it the
//! endpoint blocks until the video is rendered.

use async_trait::async_trait;
use serde_json::{json, Value};
use vidgen_core::{Job, Mode, ProviderFormat, RemoteHandle, ResultRef};

use crate::adapter::{effective_prompt, prompt_preview, AdapterSettings, ProviderAdapter, RemoteStatus};
use crate::error::ProviderError;
use crate::http::{first_str, ProviderHttp};

const ENDPOINT_CREATE: &str = "/services/aigc/video-generation/video-synthesis";
const ENDPOINT_TASKS: &str = "/tasks";
const ASYNC_HEADER: (&str, &str) = ("X-DashScope-Async", "enable");

pub struct AliyunAdapter {
    http: ProviderHttp,
    settings: AdapterSettings,
}

impl AliyunAdapter {
    pub fn new(http: ProviderHttp, settings: AdapterSettings) -> Self {
        tracing::info!(base_url = http.base_url(), model = %settings.provider_model, "Aliyun adapter ready");
        Self { http, settings }
    }
}

/// Build the video-synthesis request body.
pub fn build_submit_body(job: &Job, settings: &AdapterSettings) -> Value {
    let mut input = json!({ "prompt": effective_prompt(job) });
    if matches!(job.mode, Mode::FirstFrame | Mode::FirstLastFrame) {
        if let Some(img) = job.images.first() {
            input["img_url"] = json!(img.as_str());
        }
    }

    let mut parameters = json!({
        "resolution": job.params.resolution.as_str().to_ascii_uppercase(),
        "duration": job.params.duration_secs,
        "prompt_extend": settings.prompt_extend,
        "watermark": settings.watermark,
    });
    if job.music.is_some() {
        parameters["audio"] = json!(true);
    }

    json!({
        "model": settings.provider_model,
        "input": input,
        "parameters": parameters,
    })
}

/// Map a `GET /tasks/{id}` response onto [`RemoteStatus`].
pub fn parse_status(body: &Value) -> Result<RemoteStatus, ProviderError> {
    let output = body.get("output").unwrap_or(&Value::Null);
    let status = output
        .get("task_status")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    match status {
        "PENDING" => Ok(RemoteStatus::Running { progress: Some(10) }),
        "RUNNING" | "SUSPENDED" => Ok(RemoteStatus::Running { progress: Some(50) }),
        "SUCCEEDED" => match first_str(output, &["/video_url"]) {
            Some(url) => Ok(RemoteStatus::Succeeded(ResultRef::new(url))),
            None => Ok(RemoteStatus::Failed(
                "task succeeded without a video URL".to_string(),
            )),
        },
        "FAILED" | "CANCELED" => {
            let message = first_str(output, &["/message"]).unwrap_or("generation failed");
            let reason = match first_str(output, &["/code"]) {
                Some(code) => format!("{code}: {message}"),
                None => message.to_string(),
            };
            Ok(RemoteStatus::Failed(reason))
        }
        other => Err(ProviderError::transient(format!(
            "unrecognized task status '{other}'"
        ))),
    }
}

#[async_trait]
impl ProviderAdapter for AliyunAdapter {
    fn format(&self) -> ProviderFormat {
        ProviderFormat::Aliyun
    }

    async fn submit(&self, job: &Job) -> Result<RemoteHandle, ProviderError> {
        let body = build_submit_body(job, &self.settings);
        tracing::info!(
            job_id = %job.id,
            model = %self.settings.provider_model,
            mode = %job.mode,
            prompt = %prompt_preview(&job.prompt),
            "Creating Aliyun task",
        );

        let response = self
            .http
            .post_json(ENDPOINT_CREATE, &body, &[ASYNC_HEADER])
            .await?;
        let task_id = first_str(&response, &["/output/task_id"]).ok_or_else(|| {
            ProviderError::permanent(format!("no task id in response: {response}"))
        })?;

        tracing::info!(job_id = %job.id, task_id, "Aliyun task created");
        Ok(RemoteHandle::new(task_id))
    }

    async fn status(&self, handle: &RemoteHandle) -> Result<RemoteStatus, ProviderError> {
        let body = self
            .http
            .get_json(&format!("{ENDPOINT_TASKS}/{}", handle.task_id))
            .await?;
        parse_status(&body)
    }
}
