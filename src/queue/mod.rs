//! The per-session ordered job queue with retry/backoff and the
//! completed/failed/stalled event stream (spec.md §4.C).

mod events;
mod service;

pub use events::{QueueEvent, QueueEventHub, QueueEventStream};
pub use service::{FailureOutcome, JobCounts, QueueService, QueueStats};

use miette::Diagnostic;
use thiserror::Error;

use crate::kv::KvError;
use crate::registry::RegistryError;

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error("corrupt job record: {0}")]
    #[diagnostic(code(session_core::queue::corrupt))]
    Corrupt(#[from] serde_json::Error),
}
