//! Typed async wrapper over the shared KV store (spec.md §4.A).
//!
//! [`KvClient`] is the seam between the rest of the core and the backing
//! store. [`RedisKvClient`] is the production implementation; it keeps two
//! independent connections — one for commands, one for subscriptions — and
//! implements [`KvClient::compare_and_delete`] with an atomic Lua script,
//! never the racy read-then-delete. [`InMemoryKvClient`] is a
//! process-local fake with the same TTL and atomicity semantics, used by
//! the test suite.

mod memory;
mod redis_client;

pub use memory::InMemoryKvClient;
pub use redis_client::RedisKvClient;

use async_trait::async_trait;
use miette::Diagnostic;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a [`KvClient`] implementation.
#[derive(Debug, Error, Diagnostic)]
pub enum KvError {
    /// The connection to the backing store was lost or never established.
    /// Per spec.md §4.A/§7, callers retry with bounded backoff and only
    /// surface this once retries are exhausted.
    #[error("transient KV error: {message}")]
    #[diagnostic(
        code(session_core::kv::transient),
        help("the store connection was lost; this is usually transient and safe to retry")
    )]
    Transient { message: String },

    /// The backing store rejected the command (malformed key, wrong type,
    /// script error, etc). Not retryable without changing the request.
    #[error("KV backend error: {message}")]
    #[diagnostic(code(session_core::kv::backend))]
    Backend { message: String },
}

impl KvError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, KvError>;

/// One page of a cursor-based key scan. A `next_cursor` of `0` signals the
/// scan has completed; callers should keep calling
/// [`KvClient::scan`] with the returned cursor until then (mirroring Redis
/// `SCAN` semantics).
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub next_cursor: u64,
    pub keys: Vec<String>,
}

/// A message delivered to a pub/sub subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// A live subscription to a channel or pattern. Dropping it unsubscribes.
pub struct Subscription {
    receiver: tokio::sync::mpsc::Receiver<PubSubMessage>,
    _guard: Option<tokio::task::JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        receiver: tokio::sync::mpsc::Receiver<PubSubMessage>,
        guard: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            receiver,
            _guard: guard,
        }
    }

    /// Receive the next message, or `None` once the subscription is
    /// closed (store shutdown, connection dropped and not yet
    /// re-established).
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self._guard.take() {
            handle.abort();
        }
    }
}

/// Typed async operations over the shared KV store (spec.md §4.A).
///
/// Implementations must be `Send + Sync` so a single client can be shared
/// (behind an `Arc`) across every task on a host.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set `key` to `value` only if it does not already exist. Returns
    /// `true` if the value was set. This is the primitive
    /// [`crate::lease::SessionLease::acquire`] is built on.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Atomically delete `key` only if its current value equals
    /// `expected`. Returns `true` if the key was deleted. Implemented via
    /// a scripted compare-and-delete — never a plain `get` then `delete` —
    /// because that races with TTL expiry (spec.md §4.A, §9).
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Write multiple fields of a hash, refreshing its TTL.
    async fn hash_write(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn hash_read_all(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Push `value` onto the head of the list at `key`, refreshing its
    /// TTL.
    async fn list_push_head(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Trim the list at `key` to the inclusive range `[start, stop]`
    /// (0-based, head first).
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Atomically remove and return the tail element of the list at
    /// `key` (the oldest, for a list built with [`KvClient::list_push_head`]
    /// as a FIFO), or `None` if empty. The [`crate::queue`] module's
    /// per-session queue is built on exactly this push-head/pop-tail pair,
    /// the same idiom `LPUSH`/`RPOP` implements over a plain Redis list.
    async fn list_pop_tail(&self, key: &str) -> Result<Option<String>>;

    /// Read the inclusive range `[start, stop]` of the list at `key`,
    /// head first. Not in the spec's literal operation list but required
    /// to serve client UI snapshots from the bounded list.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Add `member` to the sorted set at `key` with the given score,
    /// refreshing its TTL. Equal re-adds of the same member are harmless
    /// (spec.md §4.B): callers serialize members so re-insertion during
    /// replay does not collide unless the payload is byte-identical.
    async fn sorted_set_add(
        &self,
        key: &str,
        score: f64,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Return all members scored in `[min, max]`, ascending by score.
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>>;

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64>;

    /// One page of a cursor-based scan over keys matching `pattern`. Pass
    /// `cursor = 0` to start; stop once the returned `next_cursor` is `0`.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage>;

    /// Convenience wrapper that drives [`KvClient::scan`] to completion
    /// and collects every matching key. Spec.md §4.B explicitly allows
    /// `ListActive` results to be eventually consistent, so this is safe
    /// for callers that don't need bounded batches (the idle reaper uses
    /// [`KvClient::scan`] directly instead, for its batch-size bound).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let page = self.scan(pattern, cursor, 100).await?;
            keys.extend(page.keys);
            cursor = page.next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to an exact channel name or a glob pattern (e.g.
    /// `session-control:*`). The subscription must be re-established by
    /// the implementation after a reconnect; callers never see a silent
    /// gap beyond the reconnect delay.
    async fn subscribe(&self, channel_or_pattern: &str) -> Result<Subscription>;

    async fn delete_many(&self, keys: &[String]) -> Result<()>;
}
