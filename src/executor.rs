//! The opaque action-executor seam (spec.md §1, §4.D).
//!
//! Browser automation (or whatever backs a step) is explicitly out of
//! scope; this crate only calls through [`Executor`]. Recovery replay
//! (spec.md §4.D step 1, §9) goes through [`Executor::replay_step`]
//! instead of [`Executor::execute_step`] so an implementation can
//! rebuild in-process state (e.g. re-open a page at the same URL)
//! without re-emitting client-visible side effects.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::StepPayload;

#[derive(Debug, Error)]
#[error("step execution failed: {0}")]
pub struct ExecutorError(pub String);

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The action executor a worker delegates to. Implementations are
/// expected to be `Send + Sync` and safe to share across every worker
/// task on a host.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `step` for `session_id`, returning `Ok(())` on success.
    /// Errors are retried by the queue up to `maxAttempts` with backoff
    /// (spec.md §4.D step 4).
    async fn execute_step(&self, session_id: &str, step: &StepPayload) -> Result<(), ExecutorError>;

    /// Replay an already-completed step during recovery (spec.md §4.D
    /// step 1, §9). Must not emit a client-visible completion
    /// notification; the worker manager never calls
    /// [`crate::notify::CompletionNotifier`] for replayed steps.
    async fn replay_step(&self, session_id: &str, step: &crate::model::Step) -> Result<(), ExecutorError>;
}

/// An [`Executor`] that succeeds trivially. Useful for tests and as the
/// default in examples that don't wire up a real automation backend.
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
    async fn execute_step(&self, _session_id: &str, _step: &StepPayload) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn replay_step(&self, _session_id: &str, _step: &crate::model::Step) -> Result<(), ExecutorError> {
        Ok(())
    }
}
