//! Engine and model configuration.
//!
//! [`EngineConfig`] holds queue, polling and download settings and is read
//! from environment variables. Per-model settings ([`ModelConfig`]) come
//! from a JSON map keyed by model id; `${VAR}` references inside
//! `api_key` and `base_url` are expanded from the environment at load time.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::request::Resolution;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Unknown provider format: '{0}'. Valid formats: volcengine, aliyun, zhipu, openai")]
    UnknownFormat(String),

    #[error("Model '{id}': {reason}")]
    Model { id: String, reason: String },

    #[error("Failed to read models file {path}: {source}")]
    ModelsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse models file: {0}")]
    ModelsJson(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Provider format
// ---------------------------------------------------------------------------

/// Remote API family a model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFormat {
    Volcengine,
    Aliyun,
    Zhipu,
    #[serde(rename = "openai")]
    OpenAiCompatible,
}

impl ProviderFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderFormat::Volcengine => "volcengine",
            ProviderFormat::Aliyun => "aliyun",
            ProviderFormat::Zhipu => "zhipu",
            ProviderFormat::OpenAiCompatible => "openai",
        }
    }

    /// Base URL used when a model config leaves `base_url` empty.
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderFormat::Volcengine => "https://ark.cn-beijing.volces.com/api/v3",
            ProviderFormat::Aliyun => "https://dashscope.aliyuncs.com/api/v1",
            ProviderFormat::Zhipu => "https://open.bigmodel.cn/api",
            ProviderFormat::OpenAiCompatible => "https://api.openai.com/v1",
        }
    }
}

impl fmt::Display for ProviderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "volcengine" => Ok(ProviderFormat::Volcengine),
            "aliyun" => Ok(ProviderFormat::Aliyun),
            "zhipu" => Ok(ProviderFormat::Zhipu),
            "openai" | "openai-compatible" => Ok(ProviderFormat::OpenAiCompatible),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Model config
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Settings for one registered model.
///
/// `format` stays a plain string here so an unknown value surfaces as a
/// registration error naming the model instead of a JSON parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Empty means the provider's default endpoint.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub format: String,
    /// Provider-side model identifier.
    pub model: String,
    #[serde(default)]
    pub default_resolution: Option<Resolution>,
    #[serde(default)]
    pub default_duration: Option<u32>,
    #[serde(default)]
    pub default_fps: Option<u32>,
    #[serde(default = "default_true")]
    pub support_img2video: bool,
    #[serde(default)]
    pub support_first_last: Option<bool>,
    #[serde(default)]
    pub support_music: Option<bool>,
    #[serde(default)]
    pub watermark: bool,
    #[serde(default = "default_true")]
    pub prompt_extend: bool,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl ModelConfig {
    /// Minimal config for `format` and provider model id; every optional
    /// field at its default.
    pub fn new(format: ProviderFormat, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            name: model.clone(),
            base_url: String::new(),
            api_key: String::new(),
            format: format.as_str().to_string(),
            model,
            default_resolution: None,
            default_duration: None,
            default_fps: None,
            support_img2video: true,
            support_first_last: None,
            support_music: None,
            watermark: false,
            prompt_extend: true,
            request_timeout_secs: None,
        }
    }

    pub fn parsed_format(&self) -> Result<ProviderFormat, ConfigError> {
        self.format.parse()
    }

    /// Base URL without a trailing slash, falling back to the provider default.
    pub fn effective_base_url(&self, format: ProviderFormat) -> String {
        let url = self.base_url.trim();
        if url.is_empty() {
            format.default_base_url().to_string()
        } else {
            url.trim_end_matches('/').to_string()
        }
    }

    /// Expand `${VAR}` references in `api_key` and `base_url`.
    pub fn expand_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.api_key = expand_env_refs(&self.api_key, &lookup);
        self.base_url = expand_env_refs(&self.base_url, &lookup);
        self
    }

    /// Reject configs that cannot produce a working adapter.
    pub fn validate(&self, id: &str) -> Result<ProviderFormat, ConfigError> {
        let format = self.parsed_format()?;
        if self.model.trim().is_empty() {
            return Err(ConfigError::Model {
                id: id.to_string(),
                reason: "missing provider model name".to_string(),
            });
        }
        if let Some(0) = self.default_duration {
            return Err(ConfigError::Model {
                id: id.to_string(),
                reason: "default_duration must be positive".to_string(),
            });
        }
        if let Some(0) = self.default_fps {
            return Err(ConfigError::Model {
                id: id.to_string(),
                reason: "default_fps must be positive".to_string(),
            });
        }
        Ok(format)
    }
}

/// Matches `${NAME}` references.
static ENV_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Replace every `${NAME}` with `lookup(NAME)`, or an empty string when unset.
pub fn expand_env_refs<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if !value.contains("${") {
        return value.to_string();
    }
    ENV_REF_RE
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match lookup(name) {
                Some(v) if !v.is_empty() => v,
                _ => {
                    tracing::warn!(var = name, "Environment variable referenced in model config is not set");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Parse a JSON object of model id -> [`ModelConfig`], preserving file order.
pub fn parse_models(json: &str) -> Result<IndexMap<String, ModelConfig>, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

/// Read and parse a models file, expanding `${VAR}` references from the
/// process environment.
pub fn load_models_file(path: &Path) -> Result<IndexMap<String, ModelConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ModelsFile {
        path: path.to_path_buf(),
        source,
    })?;
    let models = parse_models(&raw)?;
    Ok(models
        .into_iter()
        .map(|(id, cfg)| (id, cfg.expand_env_with(|k| std::env::var(k).ok())))
        .collect())
}

// ---------------------------------------------------------------------------
// Engine config
// ---------------------------------------------------------------------------

/// Queue, polling and download settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of non-terminal jobs.
    pub max_queue_size: usize,
    /// Ceiling on time between submission and a terminal remote status.
    pub task_timeout: Duration,
    /// First polling delay.
    pub poll_interval: Duration,
    /// Cap on the polling delay.
    pub max_poll_interval: Duration,
    pub poll_backoff_factor: f64,
    /// Random jitter ratio in `0.0..=1.0` applied to each polling delay.
    pub poll_jitter: f64,
    /// Extra attempts after a transient submit error.
    pub submit_retries: u32,
    /// Extra attempts after an interrupted transfer.
    pub download_retries: u32,
    pub download_dir: PathBuf,
    /// Finished artifacts kept in `download_dir`; oldest are pruned.
    pub max_artifacts: usize,
    /// How long terminal job summaries stay queryable.
    pub history_retention: Duration,
    /// Upper bound on retained terminal summaries.
    pub history_limit: usize,
    pub default_model: Option<String>,
    pub models_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            task_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(30),
            poll_backoff_factor: 1.5,
            poll_jitter: 0.0,
            submit_retries: 3,
            download_retries: 3,
            download_dir: PathBuf::from("./downloads"),
            max_artifacts: 10,
            history_retention: Duration::from_secs(3600),
            history_limit: 200,
            default_model: None,
            models_file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default       | Range      |
    /// |--------------------------|---------------|------------|
    /// | `MAX_QUEUE_SIZE`         | `10`          | 1..=100    |
    /// | `TASK_TIMEOUT_SECS`      | `600`         | 60..=3600  |
    /// | `POLL_INTERVAL_SECS`     | `5`           | 1..=30     |
    /// | `MAX_POLL_INTERVAL_SECS` | `30`          | >= poll    |
    /// | `POLL_BACKOFF_FACTOR`    | `1.5`         | 1.0..=10.0 |
    /// | `POLL_JITTER`            | `0.0`         | 0.0..=1.0  |
    /// | `SUBMIT_RETRIES`         | `3`           | 0..=10     |
    /// | `DOWNLOAD_RETRIES`       | `3`           | 0..=10     |
    /// | `DOWNLOAD_DIR`           | `./downloads` |            |
    /// | `MAX_ARTIFACTS`          | `10`          | 1..=1000   |
    /// | `HISTORY_RETENTION_SECS` | `3600`        |            |
    /// | `HISTORY_LIMIT`          | `200`         |            |
    /// | `DEFAULT_MODEL`          | unset         |            |
    /// | `MODELS_FILE`            | unset         |            |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_queue_size: usize = parse_var(&lookup, "MAX_QUEUE_SIZE", defaults.max_queue_size)?;
        check_range("MAX_QUEUE_SIZE", max_queue_size as f64, 1.0, 100.0)?;

        let task_timeout: u64 =
            parse_var(&lookup, "TASK_TIMEOUT_SECS", defaults.task_timeout.as_secs())?;
        check_range("TASK_TIMEOUT_SECS", task_timeout as f64, 60.0, 3600.0)?;

        let poll_interval: u64 =
            parse_var(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?;
        check_range("POLL_INTERVAL_SECS", poll_interval as f64, 1.0, 30.0)?;

        let max_poll_interval: u64 = parse_var(
            &lookup,
            "MAX_POLL_INTERVAL_SECS",
            defaults.max_poll_interval.as_secs().max(poll_interval),
        )?;
        check_range(
            "MAX_POLL_INTERVAL_SECS",
            max_poll_interval as f64,
            poll_interval as f64,
            3600.0,
        )?;

        let poll_backoff_factor: f64 =
            parse_var(&lookup, "POLL_BACKOFF_FACTOR", defaults.poll_backoff_factor)?;
        if poll_backoff_factor.is_nan() || poll_backoff_factor <= 1.0 {
            return Err(ConfigError::Invalid {
                key: "POLL_BACKOFF_FACTOR",
                value: poll_backoff_factor.to_string(),
                reason: "must be greater than 1".into(),
            });
        }
        check_range("POLL_BACKOFF_FACTOR", poll_backoff_factor, 1.0, 10.0)?;

        let poll_jitter: f64 = parse_var(&lookup, "POLL_JITTER", defaults.poll_jitter)?;
        check_range("POLL_JITTER", poll_jitter, 0.0, 1.0)?;

        let submit_retries: u32 = parse_var(&lookup, "SUBMIT_RETRIES", defaults.submit_retries)?;
        check_range("SUBMIT_RETRIES", submit_retries as f64, 0.0, 10.0)?;

        let download_retries: u32 =
            parse_var(&lookup, "DOWNLOAD_RETRIES", defaults.download_retries)?;
        check_range("DOWNLOAD_RETRIES", download_retries as f64, 0.0, 10.0)?;

        let download_dir = lookup("DOWNLOAD_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir);

        let max_artifacts: usize = parse_var(&lookup, "MAX_ARTIFACTS", defaults.max_artifacts)?;
        check_range("MAX_ARTIFACTS", max_artifacts as f64, 1.0, 1000.0)?;

        let history_retention: u64 = parse_var(
            &lookup,
            "HISTORY_RETENTION_SECS",
            defaults.history_retention.as_secs(),
        )?;
        let history_limit: usize = parse_var(&lookup, "HISTORY_LIMIT", defaults.history_limit)?;

        let default_model = lookup("DEFAULT_MODEL").filter(|v| !v.trim().is_empty());
        let models_file = lookup("MODELS_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            max_queue_size,
            task_timeout: Duration::from_secs(task_timeout),
            poll_interval: Duration::from_secs(poll_interval),
            max_poll_interval: Duration::from_secs(max_poll_interval),
            poll_backoff_factor,
            poll_jitter,
            submit_retries,
            download_retries,
            download_dir,
            max_artifacts,
            history_retention: Duration::from_secs(history_retention),
            history_limit,
            default_model,
            models_file,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn check_range(key: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("MAX_QUEUE_SIZE", "3"),
            ("TASK_TIMEOUT_SECS", "120"),
            ("POLL_INTERVAL_SECS", "2"),
            ("DOWNLOAD_DIR", "/var/vidgen"),
            ("DEFAULT_MODEL", "cog"),
        ]))
        .unwrap();
        assert_eq!(config.max_queue_size, 3);
        assert_eq!(config.task_timeout, Duration::from_secs(120));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.download_dir, PathBuf::from("/var/vidgen"));
        assert_eq!(config.default_model.as_deref(), Some("cog"));
    }

    #[test]
    fn queue_size_out_of_range_rejected() {
        let result = EngineConfig::from_lookup(lookup_from(&[("MAX_QUEUE_SIZE", "0")]));
        assert_matches!(result, Err(ConfigError::OutOfRange { key: "MAX_QUEUE_SIZE", .. }));

        let result = EngineConfig::from_lookup(lookup_from(&[("MAX_QUEUE_SIZE", "101")]));
        assert_matches!(result, Err(ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn timeout_and_poll_bounds_enforced() {
        let result = EngineConfig::from_lookup(lookup_from(&[("TASK_TIMEOUT_SECS", "59")]));
        assert_matches!(result, Err(ConfigError::OutOfRange { key: "TASK_TIMEOUT_SECS", .. }));

        let result = EngineConfig::from_lookup(lookup_from(&[("POLL_INTERVAL_SECS", "31")]));
        assert_matches!(result, Err(ConfigError::OutOfRange { key: "POLL_INTERVAL_SECS", .. }));
    }

    #[test]
    fn backoff_factor_must_exceed_one() {
        for value in ["1.0", "1", "0.5", "NaN"] {
            let result = EngineConfig::from_lookup(lookup_from(&[("POLL_BACKOFF_FACTOR", value)]));
            assert_matches!(
                result,
                Err(ConfigError::Invalid { key: "POLL_BACKOFF_FACTOR", .. }),
                "{value}"
            );
        }

        let result = EngineConfig::from_lookup(lookup_from(&[("POLL_BACKOFF_FACTOR", "10.5")]));
        assert_matches!(result, Err(ConfigError::OutOfRange { key: "POLL_BACKOFF_FACTOR", .. }));

        let config =
            EngineConfig::from_lookup(lookup_from(&[("POLL_BACKOFF_FACTOR", "1.01")])).unwrap();
        assert_eq!(config.poll_backoff_factor, 1.01);
    }

    #[test]
    fn unparsable_value_names_the_key() {
        let result = EngineConfig::from_lookup(lookup_from(&[("SUBMIT_RETRIES", "many")]));
        assert_matches!(result, Err(ConfigError::Invalid { key: "SUBMIT_RETRIES", .. }));
    }

    #[test]
    fn format_parsing() {
        assert_eq!("OpenAI".parse::<ProviderFormat>().ok(), Some(ProviderFormat::OpenAiCompatible));
        assert_eq!("volcengine".parse::<ProviderFormat>().ok(), Some(ProviderFormat::Volcengine));
        assert_matches!("runway".parse::<ProviderFormat>(), Err(ConfigError::UnknownFormat(_)));
    }

    #[test]
    fn env_refs_expand_and_missing_become_empty() {
        let lookup = lookup_from(&[("ARK_KEY", "sk-123")]);
        assert_eq!(expand_env_refs("${ARK_KEY}", &lookup), "sk-123");
        assert_eq!(expand_env_refs("Bearer ${ARK_KEY}!", &lookup), "Bearer sk-123!");
        assert_eq!(expand_env_refs("${NOPE}", &lookup), "");
        assert_eq!(expand_env_refs("plain", &lookup), "plain");
    }

    #[test]
    fn models_parse_in_file_order_with_defaults() {
        let json = r#"{
            "seedance": {"format": "volcengine", "model": "doubao-seedance-1-5-pro-251215", "api_key": "${ARK_KEY}"},
            "cog": {"format": "zhipu", "model": "cogvideox-3", "default_resolution": "1080p"}
        }"#;
        let models = parse_models(json).unwrap();
        let ids: Vec<&str> = models.keys().map(String::as_str).collect();
        assert_eq!(ids, ["seedance", "cog"]);

        let cog = &models["cog"];
        assert!(cog.support_img2video);
        assert!(cog.prompt_extend);
        assert_eq!(cog.default_resolution, Some(Resolution::P1080));

        let seedance = models["seedance"]
            .clone()
            .expand_env_with(lookup_from(&[("ARK_KEY", "k")]));
        assert_eq!(seedance.api_key, "k");
    }

    #[test]
    fn model_validation() {
        let mut cfg = ModelConfig::new(ProviderFormat::Aliyun, "wan2.5-i2v-plus");
        assert_eq!(cfg.validate("m").ok(), Some(ProviderFormat::Aliyun));

        cfg.model = " ".into();
        assert_matches!(cfg.validate("m"), Err(ConfigError::Model { .. }));

        cfg.format = "bogus".into();
        assert_matches!(cfg.validate("m"), Err(ConfigError::UnknownFormat(_)));
    }

    #[test]
    fn base_url_falls_back_and_trims_slash() {
        let mut cfg = ModelConfig::new(ProviderFormat::Zhipu, "cogvideox-3");
        assert_eq!(
            cfg.effective_base_url(ProviderFormat::Zhipu),
            "https://open.bigmodel.cn/api"
        );
        cfg.base_url = "http://localhost:8080/".into();
        assert_eq!(cfg.effective_base_url(ProviderFormat::Zhipu), "http://localhost:8080");
    }
}
