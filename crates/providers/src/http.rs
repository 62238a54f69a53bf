//! Shared JSON-over-HTTP plumbing for provider adapters.
//!
//! Wraps a pooled [`reqwest::Client`] with bearer authentication, a
//! per-model request timeout, and error extraction from the common
//! provider error body shapes.

use std::time::Duration;

use serde_json::Value;

use crate::error::ProviderError;

/// Default per-request timeout when the model config does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Authenticated JSON client for one provider endpoint.
#[derive(Clone)]
pub struct ProviderHttp {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ProviderHttp {
    /// Create a client reusing an existing [`reqwest::Client`] so all
    /// models share one connection pool.
    ///
    /// * `base_url` - API root without a trailing slash.
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
    }

    /// `POST {base}{path}` with a JSON body and optional extra headers.
    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        extra_headers: &[(&str, &str)],
    ) -> Result<Value, ProviderError> {
        let mut builder = self.authorized(self.client.post(self.url(path))).json(body);
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        let response = builder.send().await?;
        Self::parse_response(response).await
    }

    /// `GET {base}{path}`.
    pub async fn get_json(&self, path: &str) -> Result<Value, ProviderError> {
        let response = self
            .authorized(self.client.get(self.url(path)))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    /// `DELETE {base}{path}`, discarding the body.
    pub async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let response = self
            .authorized(self.client.delete(self.url(path)))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    // ---- private helpers ----

    /// Return the response unchanged on success, or a classified
    /// [`ProviderError`] carrying the provider's error message.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| extract_error_message(&v))
                .unwrap_or_else(|| {
                    if body.trim().is_empty() {
                        format!("HTTP {}", status.as_u16())
                    } else {
                        body
                    }
                });
            return Err(ProviderError::from_status(status.as_u16(), message));
        }
        Ok(response)
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value, ProviderError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::transient(format!("malformed JSON response: {e}")))
    }
}

/// Pull a human-readable message out of `error.message`, `error`,
/// `message` or `msg`.
pub fn extract_error_message(body: &Value) -> Option<String> {
    if let Some(error) = body.get("error") {
        if let Some(msg) = error.get("message").and_then(Value::as_str) {
            return Some(msg.to_string());
        }
        if let Some(msg) = error.as_str() {
            return Some(msg.to_string());
        }
        if !error.is_null() {
            return Some(error.to_string());
        }
    }
    ["message", "msg"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// First string found at any of the given JSON pointers.
pub fn first_str<'a>(body: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .filter_map(|p| body.pointer(p).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// Read an optional numeric progress value, clamped to `0..=100`.
pub fn progress_at(body: &Value, pointer: &str) -> Option<u8> {
    body.pointer(pointer)
        .and_then(Value::as_f64)
        .map(|p| p.clamp(0.0, 100.0) as u8)
}
