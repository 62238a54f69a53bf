//! Model registry: model id -> live adapter, capabilities and limits.
//!
//! Jobs hold an `Arc<RegisteredModel>` taken at admission, so replacing a
//! model or swapping the default only affects later submissions.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::RwLock;
use vidgen_core::capabilities::{Capabilities, ModelProfile};
use vidgen_core::{ConfigError, CoreError, ModelConfig, ProviderFormat};

use crate::adapter::{AdapterSettings, ProviderAdapter};
use crate::aliyun::AliyunAdapter;
use crate::http::ProviderHttp;
use crate::openai::OpenAiCompatibleAdapter;
use crate::volcengine::VolcengineAdapter;
use crate::zhipu::ZhipuAdapter;

/// Alias accepted by [`ModelRegistry::resolve`] for the current default.
pub const DEFAULT_ALIAS: &str = "default";

/// One registered model. Immutable once built.
pub struct RegisteredModel {
    pub id: String,
    pub config: ModelConfig,
    pub format: ProviderFormat,
    pub profile: ModelProfile,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl RegisteredModel {
    pub fn capabilities(&self) -> Capabilities {
        self.profile.capabilities
    }
}

impl std::fmt::Debug for RegisteredModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModel")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

/// Listing entry returned by [`ModelRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub format: ProviderFormat,
    pub provider_model: String,
    pub capabilities: Capabilities,
    pub is_default: bool,
}

#[derive(Default)]
struct RegistryInner {
    models: IndexMap<String, Arc<RegisteredModel>>,
    default: Option<String>,
}

/// Thread-safe model table; wrap in `Arc` and share.
pub struct ModelRegistry {
    client: reqwest::Client,
    inner: RwLock<RegistryInner>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Build adapters on top of an existing connection pool.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Validate `config`, construct the adapter for its format and store it
    /// under `id`. The first model registered becomes the default.
    pub async fn register(
        &self,
        id: &str,
        config: ModelConfig,
    ) -> Result<Arc<RegisteredModel>, ConfigError> {
        let format = config.validate(id)?;
        if config.api_key.trim().is_empty() {
            tracing::warn!(model_id = id, "Model registered without an API key");
        }
        let adapter = self.build_adapter(format, &config);
        self.insert(id, config, format, adapter).await
    }

    /// Register a model with a caller-supplied adapter. The adapter must
    /// speak the format named in `config`.
    pub async fn register_adapter(
        &self,
        id: &str,
        config: ModelConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<Arc<RegisteredModel>, ConfigError> {
        let format = config.validate(id)?;
        if adapter.format() != format {
            return Err(ConfigError::Model {
                id: id.to_string(),
                reason: format!(
                    "adapter speaks {} but config says {format}",
                    adapter.format()
                ),
            });
        }
        self.insert(id, config, format, adapter).await
    }

    async fn insert(
        &self,
        id: &str,
        config: ModelConfig,
        format: ProviderFormat,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<Arc<RegisteredModel>, ConfigError> {
        if id.trim().is_empty() || id == DEFAULT_ALIAS {
            return Err(ConfigError::Model {
                id: id.to_string(),
                reason: "model id must be non-empty and not the reserved word 'default'"
                    .to_string(),
            });
        }

        let profile = ModelProfile::derive(format, &config);
        let model = Arc::new(RegisteredModel {
            id: id.to_string(),
            config,
            format,
            profile,
            adapter,
        });

        let mut inner = self.inner.write().await;
        let replaced = inner
            .models
            .insert(id.to_string(), Arc::clone(&model))
            .is_some();
        if inner.default.is_none() {
            inner.default = Some(id.to_string());
        }
        drop(inner);

        tracing::info!(
            model_id = id,
            format = %format,
            provider_model = %model.config.model,
            img2video = model.profile.capabilities.img2video,
            first_last = model.profile.capabilities.first_last_frame,
            last_frame_only = model.profile.capabilities.last_frame_only,
            music = model.profile.capabilities.music,
            replaced,
            "Model registered",
        );
        Ok(model)
    }

    fn build_adapter(&self, format: ProviderFormat, config: &ModelConfig) -> Arc<dyn ProviderAdapter> {
        let http = ProviderHttp::new(
            self.client.clone(),
            config.effective_base_url(format),
            config.api_key.clone(),
            config.request_timeout_secs.map(Duration::from_secs),
        );
        let settings = AdapterSettings::from_config(config);
        match format {
            ProviderFormat::Volcengine => Arc::new(VolcengineAdapter::new(http, settings)),
            ProviderFormat::Aliyun => Arc::new(AliyunAdapter::new(http, settings)),
            ProviderFormat::Zhipu => Arc::new(ZhipuAdapter::new(http, settings)),
            ProviderFormat::OpenAiCompatible => {
                Arc::new(OpenAiCompatibleAdapter::new(http, settings))
            }
        }
    }

    /// Look up a model by id. `None` and `"default"` select the default.
    pub async fn resolve(&self, id: Option<&str>) -> Result<Arc<RegisteredModel>, CoreError> {
        let inner = self.inner.read().await;
        let key = match id.map(str::trim) {
            None | Some("") | Some(DEFAULT_ALIAS) => inner
                .default
                .clone()
                .ok_or_else(|| CoreError::UnknownModel(DEFAULT_ALIAS.to_string()))?,
            Some(id) => id.to_string(),
        };
        inner
            .models
            .get(&key)
            .cloned()
            .ok_or(CoreError::UnknownModel(key))
    }

    /// Atomically make `id` the default for future submissions.
    pub async fn set_default(&self, id: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        if !inner.models.contains_key(id) {
            return Err(CoreError::UnknownModel(id.to_string()));
        }
        let previous = inner.default.replace(id.to_string());
        drop(inner);
        tracing::info!(model_id = id, previous = previous.as_deref().unwrap_or(""), "Default model changed");
        Ok(())
    }

    pub async fn default_id(&self) -> Option<String> {
        self.inner.read().await.default.clone()
    }

    pub async fn capabilities(&self, id: &str) -> Result<Capabilities, CoreError> {
        self.resolve(Some(id)).await.map(|m| m.capabilities())
    }

    /// All models in registration order.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let inner = self.inner.read().await;
        inner
            .models
            .values()
            .map(|m| ModelInfo {
                id: m.id.clone(),
                name: m.config.name.clone(),
                format: m.format,
                provider_model: m.config.model.clone(),
                capabilities: m.capabilities(),
                is_default: inner.default.as_deref() == Some(m.id.as_str()),
            })
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn cfg(format: ProviderFormat, model: &str) -> ModelConfig {
        ModelConfig::new(format, model)
    }

    #[tokio::test]
    async fn first_registered_becomes_default() {
        let reg = ModelRegistry::new();
        reg.register("seedance", cfg(ProviderFormat::Volcengine, "doubao-seedance-1-5-pro-251215"))
            .await
            .unwrap();
        reg.register("cog", cfg(ProviderFormat::Zhipu, "cogvideox-3"))
            .await
            .unwrap();

        assert_eq!(reg.default_id().await.as_deref(), Some("seedance"));
        assert_eq!(reg.resolve(None).await.unwrap().id, "seedance");
        assert_eq!(reg.resolve(Some("default")).await.unwrap().id, "seedance");
        assert_eq!(reg.resolve(Some("cog")).await.unwrap().format, ProviderFormat::Zhipu);
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let reg = ModelRegistry::new();
        let mut c = cfg(ProviderFormat::Aliyun, "wan2.5-i2v-plus");
        c.format = "runway".into();
        assert_matches!(reg.register("x", c).await, Err(ConfigError::UnknownFormat(_)));
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn reserved_id_is_rejected() {
        let reg = ModelRegistry::new();
        assert_matches!(
            reg.register("default", cfg(ProviderFormat::Zhipu, "cogvideox-3")).await,
            Err(ConfigError::Model { .. })
        );
    }

    #[tokio::test]
    async fn set_default_swaps_and_rejects_unknown() {
        let reg = ModelRegistry::new();
        reg.register("a", cfg(ProviderFormat::Aliyun, "wan2.5-i2v-plus")).await.unwrap();
        reg.register("b", cfg(ProviderFormat::Zhipu, "cogvideox-2")).await.unwrap();

        let bound = reg.resolve(None).await.unwrap();
        reg.set_default("b").await.unwrap();
        assert_eq!(bound.id, "a");
        assert_eq!(reg.resolve(None).await.unwrap().id, "b");

        assert_matches!(reg.set_default("zzz").await, Err(CoreError::UnknownModel(id)) if id == "zzz");
        assert_eq!(reg.default_id().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn re_registering_keeps_old_arc_alive() {
        let reg = ModelRegistry::new();
        let old = reg
            .register("m", cfg(ProviderFormat::Zhipu, "cogvideox-2"))
            .await
            .unwrap();
        reg.register("m", cfg(ProviderFormat::Zhipu, "cogvideox-3")).await.unwrap();

        assert_eq!(old.config.model, "cogvideox-2");
        assert_eq!(reg.resolve(Some("m")).await.unwrap().config.model, "cogvideox-3");
        assert_eq!(reg.list().await.len(), 1);
    }

    #[tokio::test]
    async fn capabilities_and_listing() {
        let reg = ModelRegistry::new();
        reg.register("o", cfg(ProviderFormat::OpenAiCompatible, "relay-video")).await.unwrap();
        reg.register("v", cfg(ProviderFormat::Volcengine, "doubao-seedance-1-0-pro-250528"))
            .await
            .unwrap();

        let caps = reg.capabilities("v").await.unwrap();
        assert!(caps.first_last_frame);
        assert!(!caps.music);
        assert_matches!(reg.capabilities("nope").await, Err(CoreError::UnknownModel(_)));

        let list = reg.list().await;
        let ids: Vec<&str> = list.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["o", "v"]);
        assert!(list[0].is_default);
        assert!(!list[1].is_default);
    }

    #[tokio::test]
    async fn empty_registry_has_no_default() {
        let reg = ModelRegistry::new();
        assert_matches!(reg.resolve(None).await, Err(CoreError::UnknownModel(id)) if id == "default");
    }
}
