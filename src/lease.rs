//! The owner-tagged, TTL-bounded session lease (spec.md §3, §9).
//!
//! At most one manager may hold a session's lease at any instant
//! (invariant 1, spec.md §8). Acquisition is a single atomic
//! `setIfAbsent`; release is a scripted compare-and-delete so a host that
//! has lost and re-acquired liveness after its TTL expired can never
//! delete a successor's lease.

use std::sync::Arc;
use std::time::Duration;

use crate::kv::KvClient;

fn lease_key(session_id: &str) -> String {
    format!("session:lock:{session_id}")
}

/// Session lease operations over a [`KvClient`].
///
/// Stateless: every method takes the `managerId` claiming ownership, so
/// one `SessionLease` instance can be shared across all sessions a host
/// manages.
#[derive(Clone)]
pub struct SessionLease {
    kv: Arc<dyn KvClient>,
    ttl: Duration,
}

impl SessionLease {
    pub fn new(kv: Arc<dyn KvClient>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Attempt to claim `session_id` for `manager_id`. Returns `true` if
    /// the lease was acquired, `false` if another manager already holds
    /// it (spec.md §4.D step 3).
    pub async fn acquire(&self, session_id: &str, manager_id: &str) -> crate::kv::Result<bool> {
        self.kv
            .set_if_absent(&lease_key(session_id), manager_id, Some(self.ttl))
            .await
    }

    /// Renew the lease by re-writing it with the same owner id. This is
    /// a plain `put` (not conditional) because only the current owner is
    /// expected to call it; spec.md does not require renewal to detect
    /// a concurrent takeover, since TTL expiry is the only handoff
    /// trigger (§5).
    pub async fn renew(&self, session_id: &str, manager_id: &str) -> crate::kv::Result<()> {
        self.kv
            .put(&lease_key(session_id), manager_id, Some(self.ttl))
            .await
    }

    /// Release the lease, but only if `manager_id` is still the
    /// recorded owner. Releasing a lease you do not own (already
    /// expired, or taken over by another manager) is a no-op — this is
    /// the compare-and-delete spec.md §9 calls mandatory: a plain
    /// `delete` would race with TTL expiry and could delete a
    /// successor's lease.
    pub async fn release(&self, session_id: &str, manager_id: &str) -> crate::kv::Result<bool> {
        self.kv
            .compare_and_delete(&lease_key(session_id), manager_id)
            .await
    }

    /// Current owner, if any (diagnostic / test use).
    pub async fn owner(&self, session_id: &str) -> crate::kv::Result<Option<String>> {
        self.kv.get(&lease_key(session_id)).await
    }
}
