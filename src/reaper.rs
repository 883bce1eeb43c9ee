//! The Idle Reaper (spec.md §4.E): a standalone periodic sweep that
//! terminates sessions whose `last_active_time` has gone stale.
//!
//! Mutates only session state; it never touches queues or leases
//! directly — the Worker Manager performs that cleanup once it receives
//! the `STOP` this reaper publishes.

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::kv::KvClient;
use crate::model::{now_millis, SessionStatus};
use crate::registry::{RegistryError, SessionRegistry};

#[derive(Debug, Error, Diagnostic)]
pub enum ReaperError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] crate::kv::KvError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),
}

const STATE_KEY_PATTERN: &str = "session:state:*";
const TERMINATION_REASON_IDLE_TIMEOUT: &str = "idle_timeout";

/// Periodic idle-session sweep. Spec.md §4.E's defaults: every 5 minutes,
/// 30 minute idle timeout, 100-key scan batches.
pub struct IdleReaper {
    kv: Arc<dyn KvClient>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    batch_size: usize,
}

impl IdleReaper {
    pub fn new(
        kv: Arc<dyn KvClient>,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            kv,
            registry,
            idle_timeout,
            batch_size,
        }
    }

    /// Run sweeps on `interval` forever. Intended to be driven by
    /// `tokio::spawn` — spec.md §4.E describes the reaper as "not
    /// colocated with workers", i.e. a standalone scheduled task rather
    /// than something triggered per-session.
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(reaped) if reaped > 0 => {
                    tracing::info!(target: "session_core::reaper", reaped, "idle sweep terminated sessions");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(target: "session_core::reaper", %err, "idle sweep failed");
                }
            }
        }
    }

    /// Perform one cursor-bounded sweep over every session state key,
    /// terminating any session idle longer than `idle_timeout`. Returns
    /// the number of sessions terminated.
    pub async fn sweep_once(&self) -> Result<usize, ReaperError> {
        let mut cursor = 0u64;
        let mut reaped = 0usize;
        loop {
            let page = self.kv.scan(STATE_KEY_PATTERN, cursor, self.batch_size).await?;
            for key in &page.keys {
                let Some(session_id) = key.strip_prefix("session:state:") else {
                    continue;
                };
                if self.reap_if_idle(session_id).await? {
                    reaped += 1;
                }
            }
            cursor = page.next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(reaped)
    }

    async fn reap_if_idle(&self, session_id: &str) -> Result<bool, ReaperError> {
        let Some(state) = self.registry.state(session_id).await? else {
            return Ok(false); // expired mid-scan; spec.md §4.B tolerates this
        };
        if state.status == SessionStatus::Terminated {
            return Ok(false);
        }
        let idle_for = now_millis().saturating_sub(state.last_active_time);
        if idle_for <= self.idle_timeout.as_millis() as i64 {
            return Ok(false);
        }

        self.kv
            .publish(&format!("session-control:{session_id}"), "STOP")
            .await?;
        self.registry
            .terminate(session_id, SessionStatus::Terminated, TERMINATION_REASON_IDLE_TIMEOUT)
            .await?;
        Ok(true)
    }
}
