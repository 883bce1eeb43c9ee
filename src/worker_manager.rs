//! The Worker Manager (spec.md §4.D): claims announced sessions under
//! capacity, spawns one single-concurrency worker task per claimed
//! session, drives crash-recovery replay, and handles cooperative `STOP`.
//!
//! Each worker is an explicit supervised task with two inputs — a pull
//! loop against the session's queue, and a `watch`-channel stop signal —
//! rather than any ambient event-loop abstraction (spec.md §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executor::Executor;
use crate::kv::KvClient;
use crate::lease::SessionLease;
use crate::model::{now_millis, SessionStatus};
use crate::notify::CompletionNotifier;
use crate::queue::{FailureOutcome, QueueError, QueueEventHub, QueueService};
use crate::registry::{RegistryError, SessionRegistry};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const QUEUE_EVENT_HUB_CAPACITY: usize = 1024;

#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] crate::kv::KvError),

    #[error("recovery replay failed for session {session_id}: {message}")]
    #[diagnostic(code(session_core::worker_manager::replay_failed))]
    Replay { session_id: String, message: String },
}

struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    #[allow(dead_code)]
    created_at: i64,
}

/// One instance per host process (spec.md §4.D). Identified by a
/// per-process `managerId`.
pub struct WorkerManager {
    manager_id: String,
    kv: Arc<dyn KvClient>,
    registry: Arc<SessionRegistry>,
    queue: Arc<QueueService>,
    lease: SessionLease,
    executor: Arc<dyn Executor>,
    notifier: Arc<dyn CompletionNotifier>,
    max_workers: usize,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerManager {
    /// `kv` is the only store dependency; the registry's record TTL and
    /// the lease TTL use the specification's documented defaults (1 h,
    /// 30 s). Use [`WorkerManager::with_ttls`] to override them from a
    /// loaded [`crate::config::Config`].
    pub fn new(
        kv: Arc<dyn KvClient>,
        executor: Arc<dyn Executor>,
        notifier: Arc<dyn CompletionNotifier>,
        max_workers: usize,
    ) -> Arc<Self> {
        let defaults = crate::config::Config::default();
        Self::with_ttls(
            kv,
            executor,
            notifier,
            max_workers,
            Duration::from_secs(crate::model::SESSION_RECORD_TTL_SECS),
            Duration::from_millis(defaults.session_lease_ttl_ms),
        )
    }

    pub fn with_ttls(
        kv: Arc<dyn KvClient>,
        executor: Arc<dyn Executor>,
        notifier: Arc<dyn CompletionNotifier>,
        max_workers: usize,
        record_ttl: Duration,
        lease_ttl: Duration,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&kv), record_ttl));
        let queue = Arc::new(QueueService::new(
            Arc::clone(&kv),
            Arc::clone(&registry),
            QueueEventHub::new(QUEUE_EVENT_HUB_CAPACITY),
        ));
        let lease = SessionLease::new(Arc::clone(&kv), lease_ttl);
        Arc::new(Self {
            manager_id: Uuid::new_v4().to_string(),
            kv,
            registry,
            queue,
            lease,
            executor,
            notifier,
            max_workers,
            workers: Mutex::new(HashMap::new()),
        })
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn active_session_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Direct access to this host's Queue Service, for gateways and tests
    /// driving enqueue/pause/resume/counts without a socket layer.
    pub fn queue(&self) -> &Arc<QueueService> {
        &self.queue
    }

    /// Direct access to this host's Session Registry, for gateways and
    /// tests reading state/history without a socket layer.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn lease(&self) -> &SessionLease {
        &self.lease
    }

    /// Subscribe to `new-sessions-channel` and `session-control:*` and run
    /// until a shutdown signal (`ctrl_c`) arrives, at which point every
    /// claimed worker is stopped (spec.md §5 graceful shutdown).
    pub async fn run(self: Arc<Self>) {
        let mut new_sessions = match self.kv.subscribe("new-sessions-channel").await {
            Ok(sub) => sub,
            Err(err) => {
                tracing::error!(target: "session_core::worker_manager", %err, "failed to subscribe to new-sessions-channel");
                return;
            }
        };
        let mut control = match self.kv.subscribe("session-control:*").await {
            Ok(sub) => sub,
            Err(err) => {
                tracing::error!(target: "session_core::worker_manager", %err, "failed to subscribe to session-control:*");
                return;
            }
        };

        loop {
            tokio::select! {
                msg = new_sessions.recv() => {
                    match msg {
                        Some(msg) => {
                            let manager = Arc::clone(&self);
                            tokio::spawn(async move { manager.on_new_session_announcement(&msg.payload).await; });
                        }
                        None => break,
                    }
                }
                msg = control.recv() => {
                    match msg {
                        Some(msg) => self.on_session_control(&msg.channel, &msg.payload),
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(target: "session_core::worker_manager", manager_id = %self.manager_id, "shutting down, releasing claimed sessions");
                    self.shutdown().await;
                    break;
                }
            }
        }
    }

    /// `OnNewSessionAnnouncement` (spec.md §4.D). Normally driven by the
    /// `new-sessions-channel` subscription in [`WorkerManager::run`];
    /// exposed directly for gateways that can short-circuit a local
    /// announcement, and for tests.
    pub async fn on_new_session_announcement(self: &Arc<Self>, session_id: &str) {
        if self.workers.lock().len() >= self.max_workers {
            return; // full; another host will pick it up
        }
        if self.workers.lock().contains_key(session_id) {
            return; // re-announcement to self
        }
        match self.lease.acquire(session_id, &self.manager_id).await {
            Ok(true) => {}
            Ok(false) => return, // someone else holds it
            Err(err) => {
                tracing::warn!(target: "session_core::worker_manager", %err, session_id, "lease acquire failed");
                return;
            }
        }

        // A session the idle reaper (or a prior poison-pill) marked
        // terminated may still have a state record: the reaper publishes
        // `STOP` but does not clean the registry, and nothing consumes
        // that `STOP` if no host currently holds a worker for the
        // session (spec.md §4.E). Refuse to resurrect it (invariant 6,
        // spec.md §8) until something actually clears the state record.
        match self.registry.state(session_id).await {
            Ok(Some(state)) if state.status == SessionStatus::Terminated => {
                tracing::info!(
                    target: "session_core::worker_manager",
                    session_id,
                    "refusing to spawn a worker for a terminated session; releasing lease"
                );
                let _ = self.lease.release(session_id, &self.manager_id).await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "session_core::worker_manager", %err, session_id, "state read failed; releasing lease");
                let _ = self.lease.release(session_id, &self.manager_id).await;
                return;
            }
        }

        if let Err(err) = self.spawn_worker(session_id).await {
            tracing::error!(target: "session_core::worker_manager", %err, session_id, "spawn failed; releasing lease");
            let _ = self.lease.release(session_id, &self.manager_id).await;
        }
    }

    /// `SpawnWorker` (spec.md §4.D).
    async fn spawn_worker(self: &Arc<Self>, session_id: &str) -> Result<(), ManagerError> {
        let history = self.registry.history(session_id).await?;
        if !history.is_empty() {
            self.registry
                .update_status(session_id, SessionStatus::Recovering, None)
                .await?;
            let total = history.len();
            for (index, step) in history.iter().enumerate() {
                tracing::info!(
                    target: "session_core::worker_manager",
                    session_id,
                    progress = index + 1,
                    total,
                    "replaying step"
                );
                self.executor.replay_step(session_id, step).await.map_err(|err| {
                    ManagerError::Replay {
                        session_id: session_id.to_string(),
                        message: err.0,
                    }
                })?;
            }
        }
        self.registry
            .update_status(session_id, SessionStatus::Active, None)
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.workers.lock().insert(
            session_id.to_string(),
            WorkerHandle {
                stop_tx,
                join: None,
                created_at: now_millis(),
            },
        );

        let manager = Arc::clone(self);
        let sid = session_id.to_string();
        let join = tokio::spawn(async move { manager.worker_loop(sid, stop_rx).await });
        if let Some(handle) = self.workers.lock().get_mut(session_id) {
            handle.join = Some(join);
        }
        Ok(())
    }

    /// The worker task: repeatedly claims and processes jobs for one
    /// session until told to stop or a fatal error occurs, then performs
    /// the full `StopWorker` teardown (spec.md §4.D steps 2-6).
    async fn worker_loop(self: Arc<Self>, session_id: String, mut stop_rx: watch::Receiver<bool>) {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.queue.claim_next(&session_id).await {
                Ok(Some(job)) => self.process_step(&session_id, job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = stop_rx.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::error!(target: "session_core::worker_manager", %err, session_id, "fatal queue error; stopping worker");
                    break;
                }
            }
        }
        self.teardown(&session_id).await;
    }

    /// `ProcessStep` (spec.md §4.D).
    async fn process_step(&self, session_id: &str, job: crate::model::Job) {
        match self.executor.execute_step(session_id, &job.data).await {
            Ok(()) => {
                let step = match self.registry.log_step_completion(session_id, job.data.clone()).await {
                    Ok(step) => step,
                    Err(err) => {
                        tracing::error!(target: "session_core::worker_manager", %err, session_id, "failed to record step completion");
                        return;
                    }
                };
                if let Err(err) = self.queue.ack_success(session_id, &job).await {
                    tracing::error!(target: "session_core::worker_manager", %err, session_id, "failed to ack job success");
                }
                match self.registry.state(session_id).await {
                    Ok(Some(state)) => {
                        if let Some(connection_id) = state.connection_id {
                            if let Err(err) = self
                                .notifier
                                .notify_step_completed(session_id, &connection_id, &step)
                                .await
                            {
                                tracing::warn!(target: "session_core::worker_manager", %err, session_id, "completion notification failed");
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(target: "session_core::worker_manager", %err, session_id, "failed to read session state for notification");
                    }
                }
            }
            Err(err) => {
                if let Err(update_err) = self
                    .registry
                    .update_status(session_id, SessionStatus::Error, Some(&err.0))
                    .await
                {
                    tracing::error!(target: "session_core::worker_manager", %update_err, session_id, "failed to record step error");
                }
                match self.queue.ack_failure(session_id, job, err.0).await {
                    Ok(FailureOutcome::Retrying) => {}
                    Ok(FailureOutcome::Exhausted) => {
                        tracing::warn!(target: "session_core::worker_manager", session_id, "job exhausted retries; session will be stopped");
                    }
                    Err(ack_err) => {
                        tracing::error!(target: "session_core::worker_manager", %ack_err, session_id, "failed to ack job failure");
                    }
                }
            }
        }
    }

    /// `OnSessionControl` (spec.md §4.D): signals the worker loop to
    /// finish its current job and stop. Does nothing for any message
    /// other than `STOP`, and nothing if the session isn't claimed by
    /// this host (`StopWorker` step 1).
    fn on_session_control(&self, channel: &str, message: &str) {
        if message != "STOP" {
            return;
        }
        let session_id = match channel.strip_prefix("session-control:") {
            Some(id) => id,
            None => return,
        };
        if let Some(handle) = self.workers.lock().get(session_id) {
            let _ = handle.stop_tx.send(true);
        }
    }

    /// `StopWorker` steps 3-6 (spec.md §4.D): obliterate the queue,
    /// delete registry keys, release the lease (tolerating an already
    /// expired one), and remove the worker from the local map. Order
    /// matters: queue cleanup must precede lease release so a
    /// re-announcement arriving right after release never finds stale
    /// queue state under a new owner.
    async fn teardown(&self, session_id: &str) {
        if let Err(err) = self.queue.cleanup(session_id).await {
            tracing::error!(target: "session_core::worker_manager", %err, session_id, "queue cleanup failed");
        }
        if let Err(err) = self.registry.cleanup(session_id).await {
            tracing::error!(target: "session_core::worker_manager", %err, session_id, "registry cleanup failed");
        }
        match self.lease.release(session_id, &self.manager_id).await {
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target: "session_core::worker_manager", %err, session_id, "lease release failed");
            }
        }
        self.workers.lock().remove(session_id);
    }

    /// Graceful shutdown (spec.md §5): stop every claimed worker and wait
    /// for its teardown to finish before returning.
    async fn shutdown(&self) {
        let handles: Vec<(String, WorkerHandle)> = {
            let mut workers = self.workers.lock();
            workers.drain().collect()
        };
        for (_, handle) in &handles {
            let _ = handle.stop_tx.send(true);
        }
        for (session_id, handle) in handles {
            if let Some(join) = handle.join {
                if let Err(err) = join.await {
                    tracing::warn!(target: "session_core::worker_manager", %err, session_id, "worker task panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, ExecutorError, NoopExecutor};
    use crate::kv::InMemoryKvClient;
    use crate::model::{EnqueueOptions, StepPayload};
    use crate::notify::NullNotifier;
    use async_trait::async_trait;

    fn manager(max_workers: usize) -> (Arc<WorkerManager>, Arc<dyn KvClient>) {
        let kv: Arc<dyn KvClient> = Arc::new(InMemoryKvClient::new());
        let manager = WorkerManager::with_ttls(
            Arc::clone(&kv),
            Arc::new(NoopExecutor),
            Arc::new(NullNotifier),
            max_workers,
            Duration::from_secs(3600),
            Duration::from_millis(30_000),
        );
        (manager, kv)
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn claiming_a_session_processes_enqueued_steps_in_order() {
        let (manager, _kv) = manager(5);
        manager
            .queue
            .enqueue(
                "s1",
                StepPayload {
                    id: "a".into(),
                    action: "navigate".into(),
                    data: serde_json::Value::Null,
                },
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        manager.on_new_session_announcement("s1").await;
        assert_eq!(manager.active_session_count(), 1);

        for _ in 0..200 {
            let total_steps = manager
                .registry
                .state("s1")
                .await
                .unwrap()
                .map(|s| s.total_steps)
                .unwrap_or(0);
            if total_steps >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("step was never recorded as completed");
    }

    #[tokio::test]
    async fn capacity_is_respected() {
        let (manager, _kv) = manager(1);
        manager.on_new_session_announcement("s1").await;
        assert_eq!(manager.active_session_count(), 1);
        manager.on_new_session_announcement("s2").await;
        assert_eq!(manager.active_session_count(), 1);
    }

    #[tokio::test]
    async fn re_announcement_to_self_is_ignored() {
        let (manager, _kv) = manager(5);
        manager.on_new_session_announcement("s1").await;
        assert_eq!(manager.active_session_count(), 1);
        manager.on_new_session_announcement("s1").await;
        assert_eq!(manager.active_session_count(), 1);
    }

    #[tokio::test]
    async fn stop_releases_lease_and_removes_worker() {
        let (manager, _kv) = manager(5);
        manager.on_new_session_announcement("s1").await;
        assert_eq!(manager.active_session_count(), 1);

        manager.on_session_control("session-control:s1", "STOP");
        wait_for(|| manager.active_session_count() == 0).await;

        assert_eq!(manager.lease.owner("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn poison_pill_stops_the_worker() {
        struct AlwaysFails;
        #[async_trait]
        impl Executor for AlwaysFails {
            async fn execute_step(
                &self,
                _session_id: &str,
                _step: &StepPayload,
            ) -> Result<(), ExecutorError> {
                Err(ExecutorError::new("boom"))
            }
            async fn replay_step(
                &self,
                _session_id: &str,
                _step: &crate::model::Step,
            ) -> Result<(), ExecutorError> {
                Ok(())
            }
        }

        let kv: Arc<dyn KvClient> = Arc::new(InMemoryKvClient::new());
        let manager = WorkerManager::with_ttls(
            Arc::clone(&kv),
            Arc::new(AlwaysFails),
            Arc::new(NullNotifier),
            5,
            Duration::from_secs(3600),
            Duration::from_millis(30_000),
        );
        manager
            .queue
            .enqueue(
                "s1",
                StepPayload {
                    id: "a".into(),
                    action: "navigate".into(),
                    data: serde_json::Value::Null,
                },
                EnqueueOptions {
                    attempts: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        manager.on_new_session_announcement("s1").await;
        wait_for(|| manager.active_session_count() == 0).await;

        let state = manager.registry.state("s1").await.unwrap();
        assert!(state.is_none(), "registry cleanup should have removed the state record");
    }

    #[tokio::test]
    async fn terminated_session_is_not_respawned() {
        let (manager, _kv) = manager(5);
        manager.registry.create_or_touch("s1", "conn-a").await.unwrap();
        manager
            .registry
            .terminate("s1", SessionStatus::Terminated, "idle_timeout")
            .await
            .unwrap();

        manager.on_new_session_announcement("s1").await;

        assert_eq!(manager.active_session_count(), 0);
        assert_eq!(manager.lease.owner("s1").await.unwrap(), None);
    }
}
