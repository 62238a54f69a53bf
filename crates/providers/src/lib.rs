//! Provider adapters and the model registry.
//!
//! Each remote API family gets one [`ProviderAdapter`] implementation that
//! translates a canonical [`Job`](vidgen_core::Job) into the provider's wire
//! format and maps the provider's task states back onto
//! [`RemoteStatus`]. The [`ModelRegistry`] is the only place that knows
//! which adapter type serves which [`ProviderFormat`](vidgen_core::ProviderFormat).

pub mod adapter;
pub mod aliyun;
pub mod error;
pub mod http;
pub mod openai;
pub mod registry;
pub mod volcengine;
pub mod zhipu;

pub use adapter::{ProviderAdapter, RemoteStatus};
pub use error::ProviderError;
pub use registry::{ModelInfo, ModelRegistry, RegisteredModel};
