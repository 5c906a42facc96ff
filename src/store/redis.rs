//! Redis-backed hit store.
//!
//! Each key is a sorted set of hits scored by their timestamp. One
//! `MULTI`/`EXEC` pipeline prunes, records, trims, counts and sets the
//! expiry, so concurrent processes never interleave inside a check.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{HitStore, WindowSnapshot};
use crate::error::StoreError;

/// Default namespace for keys written by turnstile.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile";

/// A [`HitStore`] backed by a Redis server.
pub struct RedisStore {
    client: Client,
    key_prefix: String,
    /// Lazily established; cleared after any failure so the next call reconnects
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `url`. No connection is made until the first hit.
    pub fn open(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
            connection: Mutex::new(None),
        })
    }

    /// The Redis key a limiter key is stored under.
    pub fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        info!(key_prefix = %self.key_prefix, "Connected to Redis");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        self.connection.lock().await.take();
    }

    /// Prune, record, trim, count, read the oldest hit and refresh the expiry,
    /// as one `MULTI`/`EXEC` block.
    fn hit_pipeline(
        full_key: &str,
        member: &str,
        now_ms: u64,
        window_ms: u64,
        retain: usize,
    ) -> redis::Pipeline {
        let keep_from = -(retain.max(1) as i64) - 1;

        let mut pipe = redis::pipe();
        pipe.atomic();
        // Before the first full window nothing can have expired yet
        if let Some(cutoff) = now_ms.checked_sub(window_ms) {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(full_key)
                .arg("-inf")
                .arg(cutoff)
                .ignore();
        }
        pipe.cmd("ZADD")
            .arg(full_key)
            .arg(now_ms)
            .arg(member)
            .ignore();
        pipe.cmd("ZREMRANGEBYRANK")
            .arg(full_key)
            .arg(0)
            .arg(keep_from)
            .ignore();
        pipe.cmd("ZCARD").arg(full_key);
        pipe.cmd("ZRANGE")
            .arg(full_key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES");
        pipe.cmd("PEXPIRE").arg(full_key).arg(window_ms).ignore();
        pipe
    }
}

#[async_trait]
impl HitStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn record_hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        retain: usize,
    ) -> Result<WindowSnapshot, StoreError> {
        let mut conn = self.connection().await?;

        let full_key = self.full_key(key);
        // Members must be unique or two hits in the same millisecond collapse
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());
        let pipe = Self::hit_pipeline(&full_key, &member, now_ms, window_ms, retain);

        let reply: Result<(u64, Vec<(String, f64)>), redis::RedisError> =
            pipe.query_async(&mut conn).await;

        let (count, oldest) = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.forget_connection().await;
                return Err(e.into());
            }
        };

        debug!(key = %full_key, count, "Recorded hit in Redis");

        Ok(WindowSnapshot {
            count,
            oldest_ms: oldest.first().map(|(_, score)| *score as u64),
        })
    }
}
