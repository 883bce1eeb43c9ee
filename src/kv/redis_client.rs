//! Production [`KvClient`] backed by Redis.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::RedisEndpoint;

use super::{KvClient, KvError, PubSubMessage, Result, ScanPage, Subscription};

const COMPARE_AND_DELETE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

const SUBSCRIBE_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Production [`KvClient`] implementation over Redis.
///
/// Maintains two independent connections, per spec.md §4.A: a
/// [`ConnectionManager`]-backed multiplexed connection for ordinary
/// commands (`GET`/`SET`/`HSET`/.../`PUBLISH`), which retries transparently
/// on connection loss, and one fresh dedicated connection per
/// subscription for `SUBSCRIBE`/`PSUBSCRIBE` (Redis requires a connection
/// in subscribe mode to do nothing else). [`KvClient::compare_and_delete`]
/// is implemented with [`Script`] so the read-then-delete is atomic on
/// the server — never a racy two-step client-side sequence.
pub struct RedisKvClient {
    client: Client,
    command: ConnectionManager,
    compare_and_delete_script: Script,
}

impl RedisKvClient {
    /// Open the command connection. Subscription connections are opened
    /// lazily, one per call to [`KvClient::subscribe`].
    pub async fn connect(endpoint: &RedisEndpoint) -> Result<Self> {
        let client = Client::open(endpoint.connection_string())
            .map_err(|err| KvError::backend(err.to_string()))?;
        let command = ConnectionManager::new(client.clone())
            .await
            .map_err(map_err)?;
        Ok(Self {
            client,
            command,
            compare_and_delete_script: Script::new(COMPARE_AND_DELETE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        // ConnectionManager is a cheap, shareable handle; cloning it does
        // not open a new socket.
        self.command.clone()
    }
}

fn map_err(err: RedisError) -> KvError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        KvError::transient(err.to_string())
    } else {
        KvError::backend(err.to_string())
    }
}

fn ttl_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| d.as_millis() as i64)
}

#[async_trait]
impl KvClient for RedisKvClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ms) = ttl_millis(ttl) {
            cmd.arg("PX").arg(ms);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(map_err)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ms) = ttl_millis(ttl) {
            cmd.arg("PX").arg(ms);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await.map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .compare_and_delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(deleted > 0)
    }

    async fn hash_write(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(map_err)?;
        if let Some(duration) = ttl {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(duration.as_secs())
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn hash_read_all(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn list_push_head(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)?;
        if let Some(duration) = ttl {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(duration.as_secs())
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn list_pop_tail(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("RPOP").arg(key).query_async(&mut conn).await.map_err(map_err)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        score: f64,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_err)?;
        if let Some(duration) = ttl {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(duration.as_secs())
                .query_async::<()>(&mut conn)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let flat: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
            let score: f64 = score
                .parse()
                .map_err(|_| KvError::backend("non-numeric score returned by ZRANGEBYSCORE"))?;
            pairs.push((member, score));
        }
        Ok(pairs)
    }

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<ScanPage> {
        let mut conn = self.conn();
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(ScanPage { next_cursor, keys })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel_or_pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let pattern = channel_or_pattern.to_string();
        let is_pattern = pattern.contains('*');

        let handle = tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(err) => {
                        tracing::warn!(target: "session_core::kv", %err, "pubsub connect failed; retrying");
                        tokio::time::sleep(SUBSCRIBE_RECONNECT_BACKOFF).await;
                        continue;
                    }
                };
                let subscribed = if is_pattern {
                    pubsub.psubscribe(&pattern).await
                } else {
                    pubsub.subscribe(&pattern).await
                };
                if let Err(err) = subscribed {
                    tracing::warn!(target: "session_core::kv", %err, pattern, "pubsub subscribe failed; retrying");
                    tokio::time::sleep(SUBSCRIBE_RECONNECT_BACKOFF).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                loop {
                    match stream.next().await {
                        Some(msg) => {
                            let channel: String = msg.get_channel_name().to_string();
                            let payload: String = match msg.get_payload() {
                                Ok(payload) => payload,
                                Err(err) => {
                                    tracing::warn!(target: "session_core::kv", %err, "dropping non-UTF8 pubsub payload");
                                    continue;
                                }
                            };
                            if tx
                                .send(PubSubMessage { channel, payload })
                                .await
                                .is_err()
                            {
                                return; // subscriber dropped; stop the task
                            }
                        }
                        None => break, // connection closed; fall through to reconnect
                    }
                }
                tracing::warn!(target: "session_core::kv", pattern, "pubsub connection closed; reconnecting");
                tokio::time::sleep(SUBSCRIBE_RECONNECT_BACKOFF).await;
            }
        });

        Ok(Subscription::new(rx, Some(handle)))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
