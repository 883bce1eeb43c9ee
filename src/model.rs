//! The data model shared by every component: sessions, steps, jobs, leases.
//!
//! All of this is, per the specification (§3), persisted state living in
//! the shared KV store — these types are the typed Rust view of that
//! state, not an in-process source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounded most-recent history list capacity (spec.md §3, §6).
pub const STEP_HISTORY_LIST_CAP: usize = 100;
/// Default TTL refreshed on every write to a session-keyed record.
pub const SESSION_RECORD_TTL_SECS: u64 = 3600;
/// Default job retry count before a job is considered a poison pill.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between job attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;

/// Lifecycle status of a session (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Active,
    Paused,
    Recovering,
    Error,
    Failed,
    Terminated,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Connected => "connected",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Recovering => "recovering",
            SessionStatus::Error => "error",
            SessionStatus::Failed => "failed",
            SessionStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(SessionStatus::Connected),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "recovering" => Ok(SessionStatus::Recovering),
            "error" => Ok(SessionStatus::Error),
            "failed" => Ok(SessionStatus::Failed),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(format!("unrecognized session status: {other}")),
        }
    }
}

/// The full attribute set of a session's state hash (spec.md §3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Millisecond epoch; refreshed on every step completion and status
    /// change.
    pub last_active_time: i64,
    /// Monotone non-decreasing count of completed steps.
    pub total_steps: u64,
    pub error: Option<String>,
    pub termination_reason: Option<String>,
    pub failed_job_id: Option<String>,
    /// Gateway-side transport id; advisory only, not a correctness key.
    pub connection_id: Option<String>,
}

impl SessionState {
    pub fn fresh(connection_id: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Connected,
            last_active_time: now_millis(),
            total_steps: 0,
            error: None,
            termination_reason: None,
            failed_job_id: None,
            connection_id: Some(connection_id.into()),
        }
    }
}

/// A completed step record (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Opaque action tag; interpreted only by the executor.
    pub action: String,
    /// Opaque payload; interpreted only by the executor.
    pub data: serde_json::Value,
    /// Completion time, millisecond epoch. Used as the sort key in
    /// history.
    pub timestamp: i64,
}

/// Backoff policy for job retries (spec.md §3, §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    Exponential { base_ms: u64 },
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        match self {
            BackoffPolicy::Exponential { base_ms } => {
                let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
                std::time::Duration::from_millis(base_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

/// Options recognized on [`crate::queue::QueueService::enqueue`]
/// (spec.md §4.C).
///
/// `priority` is deliberately not a field here: the single-concurrency-
/// per-session FIFO model this crate implements has no concept of one
/// waiting job jumping ahead of another (see `DESIGN.md`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub delay_ms: u64,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// An enqueued step awaiting execution (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub session_id: String,
    pub data: StepPayload,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Job {
    /// `jobId` format is `<sessionId>-<millis>-<9 random chars>`
    /// (spec.md §4.C). Global uniqueness is required by the backing
    /// store's contract; the random suffix plus millisecond timestamp
    /// makes collision practically impossible for a single session.
    pub fn generate_id(session_id: &str) -> String {
        use rand::Rng;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::rng();
        let suffix: String = (0..9)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{session_id}-{}-{suffix}", now_millis())
    }

    pub fn new(session_id: impl Into<String>, data: StepPayload, opts: &EnqueueOptions) -> Self {
        let session_id = session_id.into();
        let job_id = Self::generate_id(&session_id);
        Self {
            job_id,
            session_id,
            data,
            attempts_made: 0,
            max_attempts: opts.attempts.max(1),
            backoff: opts.backoff,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// The step payload a client submits, before it has a completion
/// timestamp (spec.md §3's `Step` minus `timestamp`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub id: String,
    pub action: String,
    pub data: serde_json::Value,
}

impl StepPayload {
    pub fn into_step(self, timestamp: i64) -> Step {
        Step {
            id: self.id,
            action: self.action,
            data: self.data,
            timestamp,
        }
    }
}

/// Current epoch milliseconds, used throughout as the canonical clock.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render a `DateTime<Utc>` as epoch millis, for callers that already
/// have a timestamp object (tests, replay).
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let policy = BackoffPolicy::Exponential { base_ms: 2000 };
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 2000);
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 4000);
        assert_eq!(policy.delay_for_attempt(3).as_millis(), 8000);
    }

    #[test]
    fn job_ids_are_namespaced_by_session() {
        let id = Job::generate_id("sess-1");
        assert!(id.starts_with("sess-1-"));
        let parts: Vec<&str> = id.rsplitn(2, '-').collect();
        assert_eq!(parts[0].len(), 9);
    }

    #[test]
    fn job_exhaustion_matches_max_attempts() {
        let opts = EnqueueOptions {
            attempts: 3,
            ..Default::default()
        };
        let mut job = Job::new(
            "s1",
            StepPayload {
                id: "step-1".into(),
                action: "noop".into(),
                data: serde_json::Value::Null,
            },
            &opts,
        );
        assert!(!job.is_exhausted());
        job.attempts_made = 2;
        assert!(!job.is_exhausted());
        job.attempts_made = 3;
        assert!(job.is_exhausted());
    }

    #[test]
    fn session_status_round_trips_through_string() {
        for status in [
            SessionStatus::Connected,
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Recovering,
            SessionStatus::Error,
            SessionStatus::Failed,
            SessionStatus::Terminated,
        ] {
            let s = status.to_string();
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
