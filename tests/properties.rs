//! Property-based tests for the numbered invariants in spec.md §8.
//!
//! These drive the public API directly with randomized inputs rather than
//! asserting on fixed fixtures, the way the unit tests throughout `src/`
//! do for their narrower, example-driven cases.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use session_core::kv::InMemoryKvClient;
use session_core::lease::SessionLease;
use session_core::model::{BackoffPolicy, EnqueueOptions, SessionStatus, StepPayload};
use session_core::queue::{QueueEventHub, QueueService};
use session_core::registry::SessionRegistry;

fn session_id_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,8}"
}

fn action_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("navigate".to_string()),
        Just("click".to_string()),
        Just("type".to_string()),
    ]
}

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Invariant 1: at most one of two competing managers ever acquires
    /// the same session's lease, regardless of acquisition order.
    #[test]
    fn lease_exclusivity_holds_for_any_owner_pair(
        session_id in session_id_strategy(),
        owner_a in "[a-z]{4,8}",
        owner_b in "[a-z]{4,8}",
    ) {
        prop_assume!(owner_a != owner_b);
        rt().block_on(async move {
            let lease = SessionLease::new(Arc::new(InMemoryKvClient::new()), Duration::from_secs(30));
            let a_won = lease.acquire(&session_id, &owner_a).await.unwrap();
            let b_won = lease.acquire(&session_id, &owner_b).await.unwrap();
            prop_assert!(a_won, "first acquirer must win an uncontested lease");
            prop_assert!(!b_won, "second acquirer must not win an already-held lease");
            Ok(())
        })?;
    }

    /// Invariant 2 and the round-trip property: logging N steps grows
    /// history by exactly N, and every logged step id appears, in order.
    #[test]
    fn history_grows_by_exactly_one_per_logged_step(
        session_id in session_id_strategy(),
        step_ids in prop::collection::vec("[a-z0-9]{1,6}", 1..12),
        action in action_strategy(),
    ) {
        rt().block_on(async move {
            let registry = SessionRegistry::new(Arc::new(InMemoryKvClient::new()), Duration::from_secs(3600));
            registry.create_or_touch(&session_id, "conn").await.unwrap();

            let mut expected_len = 0usize;
            for id in &step_ids {
                let before = registry.history(&session_id).await.unwrap().len();
                registry
                    .log_step_completion(
                        &session_id,
                        StepPayload { id: id.clone(), action: action.clone(), data: serde_json::Value::Null },
                    )
                    .await
                    .unwrap();
                let after = registry.history(&session_id).await.unwrap();
                expected_len += 1;
                prop_assert_eq!(after.len(), before + 1);
                prop_assert_eq!(after.len(), expected_len);
            }

            let history = registry.history(&session_id).await.unwrap();
            prop_assert_eq!(
                history.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
                step_ids.clone()
            );
            Ok(())
        })?;
    }

    /// Invariant 3: `total_steps` tracks `|History(s)|` exactly after any
    /// sequence of completions.
    #[test]
    fn total_steps_matches_history_length(
        session_id in session_id_strategy(),
        step_ids in prop::collection::vec("[a-z0-9]{1,6}", 0..12),
    ) {
        rt().block_on(async move {
            let registry = SessionRegistry::new(Arc::new(InMemoryKvClient::new()), Duration::from_secs(3600));
            registry.create_or_touch(&session_id, "conn").await.unwrap();
            for id in &step_ids {
                registry
                    .log_step_completion(
                        &session_id,
                        StepPayload { id: id.clone(), action: "navigate".into(), data: serde_json::Value::Null },
                    )
                    .await
                    .unwrap();
            }
            let history = registry.history(&session_id).await.unwrap();
            let state = registry.state(&session_id).await.unwrap().unwrap();
            prop_assert_eq!(state.total_steps as usize, history.len());
            Ok(())
        })?;
    }

    /// Invariant 6: a terminated session's state is never mistaken for an
    /// active one by any caller that only reads through `is_active`,
    /// regardless of how many steps preceded termination.
    #[test]
    fn terminated_sessions_are_never_reported_active(
        session_id in session_id_strategy(),
        step_ids in prop::collection::vec("[a-z0-9]{1,6}", 0..6),
    ) {
        rt().block_on(async move {
            let registry = SessionRegistry::new(Arc::new(InMemoryKvClient::new()), Duration::from_secs(3600));
            registry.create_or_touch(&session_id, "conn").await.unwrap();
            for id in &step_ids {
                registry
                    .log_step_completion(
                        &session_id,
                        StepPayload { id: id.clone(), action: "navigate".into(), data: serde_json::Value::Null },
                    )
                    .await
                    .unwrap();
            }
            registry
                .terminate(&session_id, SessionStatus::Terminated, "idle_timeout")
                .await
                .unwrap();
            prop_assert!(!registry.is_active(&session_id).await.unwrap());
            Ok(())
        })?;
    }

    /// Invariant 5 (poison pill): whatever sequence of failures a job
    /// goes through, it transitions to exhausted exactly once it reaches
    /// `max_attempts`, and the session is marked `failed` at that point.
    #[test]
    fn poison_pill_fires_exactly_at_max_attempts(
        session_id in session_id_strategy(),
        max_attempts in 1u32..6,
    ) {
        rt().block_on(async move {
            let kv: Arc<dyn session_core::kv::KvClient> = Arc::new(InMemoryKvClient::new());
            let registry = Arc::new(SessionRegistry::new(Arc::clone(&kv), Duration::from_secs(3600)));
            registry.create_or_touch(&session_id, "conn").await.unwrap();
            let queue = Arc::new(QueueService::new(Arc::clone(&kv), Arc::clone(&registry), QueueEventHub::new(64)));

            queue
                .enqueue(
                    &session_id,
                    StepPayload { id: "s".into(), action: "navigate".into(), data: serde_json::Value::Null },
                    EnqueueOptions {
                        attempts: max_attempts,
                        backoff: BackoffPolicy::Exponential { base_ms: 1 },
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            for attempt in 1..=max_attempts {
                // Give any scheduled backoff time to elapse so claim_next
                // doesn't spuriously see the retry as not-yet-ready.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let job = queue
                    .claim_next(&session_id)
                    .await
                    .unwrap()
                    .expect("job must be ready by now given the 1ms backoff base");
                let outcome = queue.ack_failure(&session_id, job, "boom".into()).await.unwrap();
                let should_be_exhausted = attempt == max_attempts;
                prop_assert_eq!(
                    matches!(outcome, session_core::queue::FailureOutcome::Exhausted),
                    should_be_exhausted
                );
            }

            let state = registry.state(&session_id).await.unwrap().unwrap();
            prop_assert_eq!(state.status, SessionStatus::Failed);
            prop_assert!(state.failed_job_id.is_some());
            Ok(())
        })?;
    }
}
