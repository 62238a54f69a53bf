//! Job engine: admission queue, submission dispatch, status polling and
//! artifact downloads.
//!
//! [`Orchestrator`] is the entry point. The pieces it wires together are
//! public so the command layer, or a test, can drive them individually.

pub mod download;
pub mod events;
pub mod orchestrator;
pub mod polling;
pub mod queue;

pub use download::{
    Artifact, BodyKind, DownloadError, DownloadManager, HttpRangeSource, RangeBody, RangeSource,
    TransferError,
};
pub use events::{EventBus, JobEvent};
pub use orchestrator::Orchestrator;
pub use polling::PollingEngine;
pub use queue::{CancelScope, QueueManager};
