//! The per-session ordered job queue (spec.md §4.C).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::kv::KvClient;
use crate::model::{now_millis, EnqueueOptions, Job, StepPayload};
use crate::registry::SessionRegistry;

use super::events::{QueueEvent, QueueEventHub};
use super::QueueError;

/// Bookkeeping records retained after completion/failure, bounded by
/// `removeOnComplete` / `removeOnFail` (spec.md §4.C).
const REMOVE_ON_COMPLETE: i64 = 100;
const REMOVE_ON_FAIL: i64 = 50;

fn waiting_key(session_id: &str) -> String {
    format!("rpa-session-{session_id}:waiting")
}

fn retry_key(session_id: &str) -> String {
    format!("rpa-session-{session_id}:retry")
}

fn completed_key(session_id: &str) -> String {
    format!("rpa-session-{session_id}:completed")
}

fn failed_key(session_id: &str) -> String {
    format!("rpa-session-{session_id}:failed")
}

fn paused_key(session_id: &str) -> String {
    format!("rpa-session-{session_id}:paused")
}

/// A [`Job`] plus the millisecond epoch at which it becomes eligible to
/// run, used to implement `opts.delay` and backoff between retry
/// attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedJob {
    job: Job,
    ready_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionRecord {
    job_id: String,
    completed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureRecord {
    job_id: String,
    reason: String,
    failed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub is_active: bool,
    pub job_counts: JobCounts,
    pub queue_name: String,
}

/// Outcome of [`QueueService::ack_failure`]: whether the job will be
/// retried or has become a poison pill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying,
    Exhausted,
}

/// Per-session FIFO job queue, built over a push-head/pop-tail list pair
/// in the shared KV store so any host can enqueue while only the session's
/// lease holder drains it (spec.md §4.C, §6).
///
/// Holds an `Arc<SessionRegistry>` for exactly one purpose: the poison-pill
/// transition (spec.md §7 — "session status set to `failed` by the
/// handler that consumes the signal"). The Queue Service is the only
/// component that knows `attemptsMade`/`maxAttempts`, so it is the
/// natural place to make that call rather than leaving it to the generic
/// `STOP` consumer, which receives no reason code (see `DESIGN.md`).
pub struct QueueService {
    kv: Arc<dyn KvClient>,
    registry: Arc<SessionRegistry>,
    hub: Arc<QueueEventHub>,
    active: Mutex<HashSet<String>>,
}

impl QueueService {
    pub fn new(kv: Arc<dyn KvClient>, registry: Arc<SessionRegistry>, hub: Arc<QueueEventHub>) -> Self {
        Self {
            kv,
            registry,
            hub,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn events(self: &Arc<Self>) -> super::events::QueueEventStream {
        self.hub.subscribe()
    }

    /// Enqueue a step for `session_id`. Returns the generated `jobId`.
    pub async fn enqueue(
        &self,
        session_id: &str,
        payload: StepPayload,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let ready_at = now_millis() + opts.delay_ms as i64;
        let job = Job::new(session_id, payload, &opts);
        let job_id = job.job_id.clone();
        let queued = QueuedJob { job, ready_at };
        let serialized = serde_json::to_string(&queued)?;
        self.kv.list_push_head(&waiting_key(session_id), &serialized, None).await?;
        Ok(job_id)
    }

    pub async fn pause(&self, session_id: &str) -> Result<(), QueueError> {
        self.kv.put(&paused_key(session_id), "1", None).await?;
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<(), QueueError> {
        self.kv.delete_many(&[paused_key(session_id)]).await?;
        Ok(())
    }

    async fn is_paused(&self, session_id: &str) -> Result<bool, QueueError> {
        Ok(self.kv.get(&paused_key(session_id)).await?.is_some())
    }

    /// Claim the next job ready to run for `session_id`, or `None` if the
    /// queue is paused, empty, or the head job is still waiting out its
    /// delay/backoff. Callers must hold the session's lease and never
    /// call this concurrently for the same session — concurrency = 1 is
    /// enforced by the caller (the Worker Manager), not by this method.
    ///
    /// A job retried after failure is tracked in a dedicated single-slot
    /// key rather than re-pushed onto the waiting list, so it is always
    /// the next thing claimed once ready — preserving strict per-session
    /// submission order across retries (spec.md §5).
    pub async fn claim_next(&self, session_id: &str) -> Result<Option<Job>, QueueError> {
        if self.is_paused(session_id).await? {
            return Ok(None);
        }

        if let Some(raw) = self.kv.get(&retry_key(session_id)).await? {
            let queued: QueuedJob = serde_json::from_str(&raw)?;
            if queued.ready_at > now_millis() {
                return Ok(None);
            }
            self.kv.delete_many(&[retry_key(session_id)]).await?;
            self.active.lock().insert(session_id.to_string());
            return Ok(Some(queued.job));
        }

        let key = waiting_key(session_id);
        let Some(tail) = self.kv.list_range(&key, -1, -1).await?.into_iter().next() else {
            return Ok(None);
        };
        let queued: QueuedJob = serde_json::from_str(&tail)?;
        if queued.ready_at > now_millis() {
            return Ok(None);
        }
        // Re-peek-then-pop is race-free here: only the lease holder ever
        // claims for this session, and enqueue only ever touches the
        // opposite end of the list.
        self.kv.list_pop_tail(&key).await?;
        self.active.lock().insert(session_id.to_string());
        Ok(Some(queued.job))
    }

    /// Record a successful completion and emit `completed(jobId)`.
    pub async fn ack_success(&self, session_id: &str, job: &Job) -> Result<(), QueueError> {
        self.active.lock().remove(session_id);
        let record = CompletionRecord {
            job_id: job.job_id.clone(),
            completed_at: now_millis(),
        };
        let serialized = serde_json::to_string(&record)?;
        self.kv
            .list_push_head(&completed_key(session_id), &serialized, None)
            .await?;
        self.kv
            .list_trim(&completed_key(session_id), 0, REMOVE_ON_COMPLETE - 1)
            .await?;
        self.hub.publish(QueueEvent::Completed {
            session_id: session_id.to_string(),
            job_id: job.job_id.clone(),
        });
        Ok(())
    }

    /// Record a failed attempt. Schedules a backoff retry, or — once
    /// `attempts_made` reaches `max_attempts` — records the failure,
    /// marks the session `failed` in the registry, and publishes `STOP`
    /// on `session-control:<sessionId>` (the poison-pill path, spec.md
    /// §4.C, §7).
    pub async fn ack_failure(
        &self,
        session_id: &str,
        mut job: Job,
        reason: String,
    ) -> Result<FailureOutcome, QueueError> {
        self.active.lock().remove(session_id);
        job.attempts_made += 1;

        if job.is_exhausted() {
            let record = FailureRecord {
                job_id: job.job_id.clone(),
                reason: reason.clone(),
                failed_at: now_millis(),
            };
            let serialized = serde_json::to_string(&record)?;
            self.kv
                .list_push_head(&failed_key(session_id), &serialized, None)
                .await?;
            self.kv
                .list_trim(&failed_key(session_id), 0, REMOVE_ON_FAIL - 1)
                .await?;

            self.registry.mark_failed(session_id, &job.job_id).await?;
            self.kv
                .publish(&format!("session-control:{session_id}"), "STOP")
                .await?;

            self.hub.publish(QueueEvent::Failed {
                session_id: session_id.to_string(),
                job_id: job.job_id.clone(),
                reason,
                attempts_made: job.attempts_made,
                max_attempts: job.max_attempts,
                exhausted: true,
            });
            Ok(FailureOutcome::Exhausted)
        } else {
            let delay = job.backoff.delay_for_attempt(job.attempts_made);
            let ready_at = now_millis() + delay.as_millis() as i64;
            let attempts_made = job.attempts_made;
            let max_attempts = job.max_attempts;
            let job_id = job.job_id.clone();
            let queued = QueuedJob { job, ready_at };
            let serialized = serde_json::to_string(&queued)?;
            self.kv.put(&retry_key(session_id), &serialized, None).await?;

            self.hub.publish(QueueEvent::Failed {
                session_id: session_id.to_string(),
                job_id,
                reason,
                attempts_made,
                max_attempts,
                exhausted: false,
            });
            Ok(FailureOutcome::Retrying)
        }
    }

    /// Report a job whose worker disappeared without acking it. Logged
    /// only — no policy action (spec.md §4.C).
    pub fn mark_stalled(&self, session_id: &str, job_id: &str) {
        self.active.lock().remove(session_id);
        self.hub.publish(QueueEvent::Stalled {
            session_id: session_id.to_string(),
            job_id: job_id.to_string(),
        });
    }

    pub async fn counts(&self, session_id: &str) -> Result<JobCounts, QueueError> {
        let waiting = self.kv.list_range(&waiting_key(session_id), 0, -1).await?.len()
            + usize::from(self.kv.get(&retry_key(session_id)).await?.is_some());
        let completed = self.kv.list_range(&completed_key(session_id), 0, -1).await?.len();
        let failed = self.kv.list_range(&failed_key(session_id), 0, -1).await?.len();
        let active = usize::from(self.active.lock().contains(session_id));
        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
        })
    }

    pub async fn stats(&self, session_id: &str) -> Result<QueueStats, QueueError> {
        let job_counts = self.counts(session_id).await?;
        Ok(QueueStats {
            is_active: job_counts.waiting > 0 || job_counts.active > 0,
            job_counts,
            queue_name: format!("rpa-session-{session_id}"),
        })
    }

    /// Forcibly obliterate the queue and its bookkeeping. Irreversible;
    /// used on session termination (spec.md §4.C).
    pub async fn cleanup(&self, session_id: &str) -> Result<(), QueueError> {
        self.active.lock().remove(session_id);
        self.kv
            .delete_many(&[
                waiting_key(session_id),
                retry_key(session_id),
                completed_key(session_id),
                failed_key(session_id),
                paused_key(session_id),
            ])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvClient;
    use crate::model::BackoffPolicy;
    use std::time::Duration;

    fn queue_service() -> Arc<QueueService> {
        let kv: Arc<dyn KvClient> = Arc::new(InMemoryKvClient::new());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&kv), Duration::from_secs(3600)));
        Arc::new(QueueService::new(kv, registry, QueueEventHub::new(64)))
    }

    fn payload(id: &str) -> StepPayload {
        StepPayload {
            id: id.to_string(),
            action: "navigate".to_string(),
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn jobs_drain_in_fifo_order() {
        let queue = queue_service();
        queue.enqueue("s1", payload("a"), EnqueueOptions::default()).await.unwrap();
        queue.enqueue("s1", payload("b"), EnqueueOptions::default()).await.unwrap();
        queue.enqueue("s1", payload("c"), EnqueueOptions::default()).await.unwrap();

        let first = queue.claim_next("s1").await.unwrap().unwrap();
        assert_eq!(first.data.id, "a");
        let second = queue.claim_next("s1").await.unwrap().unwrap();
        assert_eq!(second.data.id, "b");
        let third = queue.claim_next("s1").await.unwrap().unwrap();
        assert_eq!(third.data.id, "c");
        assert!(queue.claim_next("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_job_blocks_until_ready() {
        let queue = queue_service();
        queue
            .enqueue(
                "s1",
                payload("a"),
                EnqueueOptions {
                    delay_ms: 50,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(queue.claim_next("s1").await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(queue.claim_next("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retry_takes_priority_over_newer_waiting_jobs() {
        let queue = queue_service();
        let opts = EnqueueOptions {
            attempts: 3,
            backoff: BackoffPolicy::Exponential { base_ms: 1 },
            ..Default::default()
        };
        queue.enqueue("s1", payload("a"), opts.clone()).await.unwrap();
        let job_a = queue.claim_next("s1").await.unwrap().unwrap();
        queue.enqueue("s1", payload("b"), opts).await.unwrap();

        let outcome = queue.ack_failure("s1", job_a, "boom".into()).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Retrying);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let next = queue.claim_next("s1").await.unwrap().unwrap();
        assert_eq!(next.data.id, "a");
        assert_eq!(next.attempts_made, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_trigger_poison_pill() {
        let queue = queue_service();
        queue.registry.create_or_touch("s1", "conn-a").await.unwrap();
        let opts = EnqueueOptions {
            attempts: 1,
            ..Default::default()
        };
        queue.enqueue("s1", payload("a"), opts).await.unwrap();
        let job = queue.claim_next("s1").await.unwrap().unwrap();

        let outcome = queue.ack_failure("s1", job, "boom".into()).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);

        let state = queue.registry.state("s1").await.unwrap().unwrap();
        assert_eq!(state.status, crate::model::SessionStatus::Failed);
        assert!(state.failed_job_id.is_some());

        let counts = queue.counts("s1").await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn paused_queue_yields_no_jobs() {
        let queue = queue_service();
        queue.enqueue("s1", payload("a"), EnqueueOptions::default()).await.unwrap();
        queue.pause("s1").await.unwrap();
        assert!(queue.claim_next("s1").await.unwrap().is_none());
        queue.resume("s1").await.unwrap();
        assert!(queue.claim_next("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_obliterates_all_bookkeeping() {
        let queue = queue_service();
        queue.enqueue("s1", payload("a"), EnqueueOptions::default()).await.unwrap();
        queue.cleanup("s1").await.unwrap();
        let counts = queue.counts("s1").await.unwrap();
        assert_eq!(counts, JobCounts::default());
    }
}
