//! Process-local fake of the shared KV store, for tests and embeddings
//! that don't need a live Redis.
//!
//! Honors the same TTL and atomic-compare-and-delete semantics as the
//! Redis backend so property tests (spec.md §8) exercise real
//! concurrency behavior without a live server.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

use super::{KvClient, PubSubMessage, Result, ScanPage, Subscription};

const PUBSUB_CAPACITY: usize = 4096;

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_alive(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }

    fn refresh(&mut self, ttl: Option<Duration>) {
        self.expires_at = ttl.map(|d| Instant::now() + d);
    }
}

#[derive(Default)]
struct Store {
    strings: HashMap<String, Entry<String>>,
    hashes: HashMap<String, Entry<HashMap<String, String>>>,
    lists: HashMap<String, Entry<VecDeque<String>>>,
    zsets: HashMap<String, Entry<Vec<(String, f64)>>>,
}

/// An in-process fake of [`KvClient`] backed by locked `HashMap`s and a
/// `tokio::sync::broadcast` channel for pub/sub.
pub struct InMemoryKvClient {
    store: Mutex<Store>,
    pubsub: broadcast::Sender<PubSubMessage>,
}

impl Default for InMemoryKvClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvClient {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            store: Mutex::new(Store::default()),
            pubsub,
        }
    }
}

/// `pattern` may be an exact channel name or end in `*` for a prefix
/// match (the only glob shape the spec's channel names use:
/// `session-control:*`).
fn matches_pattern(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl KvClient for InMemoryKvClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let store = self.store.lock();
        Ok(store
            .strings
            .get(key)
            .filter(|e| e.is_alive())
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut store = self.store.lock();
        store
            .strings
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut store = self.store.lock();
        if store.strings.get(key).is_some_and(|e| e.is_alive()) {
            return Ok(false);
        }
        store
            .strings
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut store = self.store.lock();
        let matches = store
            .strings
            .get(key)
            .is_some_and(|e| e.is_alive() && e.value == expected);
        if matches {
            store.strings.remove(key);
        }
        Ok(matches)
    }

    async fn hash_write(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut store = self.store.lock();
        let entry = store
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(HashMap::new(), ttl));
        if !entry.is_alive() {
            entry.value.clear();
        }
        for (field, value) in fields {
            entry.value.insert(field.clone(), value.clone());
        }
        entry.refresh(ttl);
        Ok(())
    }

    async fn hash_read_all(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let store = self.store.lock();
        Ok(store
            .hashes
            .get(key)
            .filter(|e| e.is_alive())
            .map(|e| e.value.clone()))
    }

    async fn list_push_head(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut store = self.store.lock();
        let entry = store
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(VecDeque::new(), ttl));
        if !entry.is_alive() {
            entry.value.clear();
        }
        entry.value.push_front(value.to_string());
        entry.refresh(ttl);
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(entry) = store.lists.get_mut(key) {
            let len = entry.value.len() as i64;
            let start = start.clamp(0, len);
            let stop = (stop + 1).clamp(0, len);
            if start >= stop {
                entry.value.clear();
            } else {
                let trimmed: VecDeque<String> = entry
                    .value
                    .iter()
                    .skip(start as usize)
                    .take((stop - start) as usize)
                    .cloned()
                    .collect();
                entry.value = trimmed;
            }
        }
        Ok(())
    }

    async fn list_pop_tail(&self, key: &str) -> Result<Option<String>> {
        let mut store = self.store.lock();
        let Some(entry) = store.lists.get_mut(key) else {
            return Ok(None);
        };
        if !entry.is_alive() {
            return Ok(None);
        }
        Ok(entry.value.pop_back())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let store = self.store.lock();
        let Some(entry) = store.lists.get(key).filter(|e| e.is_alive()) else {
            return Ok(Vec::new());
        };
        let len = entry.value.len() as i64;
        let start = start.clamp(0, len);
        let stop = (stop + 1).clamp(0, len);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(entry
            .value
            .iter()
            .skip(start as usize)
            .take((stop - start) as usize)
            .cloned()
            .collect())
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        score: f64,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut store = self.store.lock();
        let entry = store
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Vec::new(), ttl));
        if !entry.is_alive() {
            entry.value.clear();
        }
        entry.value.retain(|(m, _)| m != member);
        entry.value.push((member.to_string(), score));
        entry.refresh(ttl);
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>> {
        let store = self.store.lock();
        let Some(entry) = store.zsets.get(key).filter(|e| e.is_alive()) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(String, f64)> = entry
            .value
            .iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(members)
    }

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64> {
        let store = self.store.lock();
        Ok(store
            .zsets
            .get(key)
            .filter(|e| e.is_alive())
            .map(|e| e.value.len() as u64)
            .unwrap_or(0))
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage> {
        let store = self.store.lock();
        let mut all_keys: Vec<&String> = store
            .strings
            .iter()
            .filter(|(_, e)| e.is_alive())
            .map(|(k, _)| k)
            .chain(
                store
                    .hashes
                    .iter()
                    .filter(|(_, e)| e.is_alive())
                    .map(|(k, _)| k),
            )
            .collect();
        all_keys.sort();
        all_keys.dedup();
        let matching: Vec<String> = all_keys
            .into_iter()
            .filter(|k| matches_pattern(pattern, k))
            .cloned()
            .collect();

        let start = cursor as usize;
        if start >= matching.len() {
            return Ok(ScanPage {
                next_cursor: 0,
                keys: Vec::new(),
            });
        }
        let end = (start + count).min(matching.len());
        let next_cursor = if end >= matching.len() { 0 } else { end as u64 };
        Ok(ScanPage {
            next_cursor,
            keys: matching[start..end].to_vec(),
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let _ = self.pubsub.send(PubSubMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channel_or_pattern: &str) -> Result<Subscription> {
        let mut receiver = self.pubsub.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let pattern = channel_or_pattern.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) if matches_pattern(&pattern, &msg.channel) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, Some(handle)))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut store = self.store.lock();
        for key in keys {
            store.strings.remove(key);
            store.hashes.remove(key);
            store.lists.remove(key);
            store.zsets.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let kv = InMemoryKvClient::new();
        assert!(kv.set_if_absent("k", "a", None).await.unwrap());
        assert!(!kv.set_if_absent("k", "b", None).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let kv = InMemoryKvClient::new();
        kv.put("lock", "owner-a", None).await.unwrap();
        assert!(!kv.compare_and_delete("lock", "owner-b").await.unwrap());
        assert!(kv.compare_and_delete("lock", "owner-a").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn releasing_an_unheld_lock_is_a_noop() {
        let kv = InMemoryKvClient::new();
        assert!(!kv.compare_and_delete("lock", "owner-a").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expiry_makes_key_absent() {
        let kv = InMemoryKvClient::new();
        kv.put("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sorted_set_range_is_ascending_by_score() {
        let kv = InMemoryKvClient::new();
        kv.sorted_set_add("z", 3.0, "c", None).await.unwrap();
        kv.sorted_set_add("z", 1.0, "a", None).await.unwrap();
        kv.sorted_set_add("z", 2.0, "b", None).await.unwrap();
        let range = kv
            .sorted_set_range_by_score("z", f64::MIN, f64::MAX)
            .await
            .unwrap();
        let members: Vec<&str> = range.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn bounded_list_trims_to_capacity() {
        let kv = InMemoryKvClient::new();
        for i in 0..5 {
            kv.list_push_head("l", &i.to_string(), None).await.unwrap();
        }
        kv.list_trim("l", 0, 2).await.unwrap();
        let range = kv.list_range("l", 0, -1).await.unwrap();
        assert_eq!(range, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn push_head_pop_tail_is_fifo() {
        let kv = InMemoryKvClient::new();
        kv.list_push_head("q", "first", None).await.unwrap();
        kv.list_push_head("q", "second", None).await.unwrap();
        kv.list_push_head("q", "third", None).await.unwrap();
        assert_eq!(kv.list_pop_tail("q").await.unwrap(), Some("first".to_string()));
        assert_eq!(kv.list_pop_tail("q").await.unwrap(), Some("second".to_string()));
        assert_eq!(kv.list_pop_tail("q").await.unwrap(), Some("third".to_string()));
        assert_eq!(kv.list_pop_tail("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_subscribe_respects_pattern() {
        let kv = InMemoryKvClient::new();
        let mut sub = kv.subscribe("session-control:*").await.unwrap();
        kv.publish("session-control:abc", "STOP").await.unwrap();
        kv.publish("new-sessions-channel", "abc").await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "session-control:abc");
        assert_eq!(msg.payload, "STOP");
    }

    #[tokio::test]
    async fn scan_keys_collects_across_pages() {
        let kv = InMemoryKvClient::new();
        for i in 0..250 {
            kv.put(&format!("session:state:{i}"), "x", None)
                .await
                .unwrap();
        }
        let keys = kv.scan_keys("session:state:*").await.unwrap();
        assert_eq!(keys.len(), 250);
    }
}
