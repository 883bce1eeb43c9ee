//! The opaque completion-notification seam (spec.md §1, §4.D step 3).
//!
//! The socket gateway is out of scope for this core; the Worker Manager
//! only needs a contract to call back into it when a step completes so
//! the gateway can relay the notification to the connected client.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Step;

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers a step-completion notification to whatever is bound to a
/// session's current `connectionId` (spec.md §4.D step 3, §9 — the core
/// does not know which host holds the client's socket, so this is left
/// entirely to the implementation).
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify_step_completed(
        &self,
        session_id: &str,
        connection_id: &str,
        step: &Step,
    ) -> Result<(), NotifyError>;
}

/// A [`CompletionNotifier`] that discards every notification. Useful for
/// tests and standalone use of this crate without a gateway attached.
pub struct NullNotifier;

#[async_trait]
impl CompletionNotifier for NullNotifier {
    async fn notify_step_completed(
        &self,
        _session_id: &str,
        _connection_id: &str,
        _step: &Step,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}
