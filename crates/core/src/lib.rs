//! Domain types and pure logic for the video-generation job core.
//!
//! The request model, job lifecycle, capability rules, backoff schedule and
//! configuration snapshot live here so that provider adapters and the
//! engine share one vocabulary. The only I/O is reading the models file.

pub mod backoff;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod hashing;
pub mod job;
pub mod request;
pub mod types;

pub use capabilities::{Capabilities, ModelProfile};
pub use config::{ConfigError, EngineConfig, ModelConfig, ProviderFormat};
pub use error::CoreError;
pub use job::{Job, JobFailure, JobState, JobSummary, RemoteHandle, ResultRef};
pub use request::{
    GenerationRequest, ImageRef, Mode, MusicRequest, MusicStyle, OutputParams, Resolution,
};
pub use types::{JobId, RequesterId, Timestamp};
