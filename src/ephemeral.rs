// src/ephemeral.rs
//! Fast write buffer for view/like increments.
//!
//! Counters live in one Redis hash per metric (`counters:view`, `counters:like`,
//! field = recipe id). Draining reads and deletes both hashes inside a single
//! MULTI/EXEC, so an increment either lands before the drain (and is returned)
//! or after it (and waits for the next flush).
//!
//! Without Redis the same contract is met in-process by [`MokaCounterStore`],
//! which is only correct for a single server instance.
use crate::error::AppResult;
use crate::models::{CounterMetric, RecipeCounts};
use async_trait::async_trait;
use moka::future::Cache;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

const FLUSH_LOCK_KEY: &str = "counters:flush_lock";

/// One buffered delta taken out of the store by a drain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingDelta {
    pub metric: CounterMetric,
    pub recipe_id: Uuid,
    pub delta: i64,
}

/// Proof of holding the flush guard; handed back on release.
#[derive(Debug)]
pub struct FlushLease {
    token: String,
}

#[async_trait]
pub trait EphemeralCounterStore: Send + Sync {
    async fn increment(&self, metric: CounterMetric, recipe_id: Uuid, delta: i64) -> AppResult<()>;

    async fn pending(&self, metric: CounterMetric, recipe_id: Uuid) -> AppResult<i64>;

    async fn pending_counts(&self, recipe_id: Uuid) -> AppResult<RecipeCounts> {
        let mut counts = RecipeCounts::default();
        for metric in CounterMetric::ALL {
            counts.add(metric, self.pending(metric, recipe_id).await?);
        }
        Ok(counts)
    }

    /// Atomically take every buffered delta and reset the buffer to empty.
    async fn drain(&self) -> AppResult<Vec<PendingDelta>>;

    /// Returns `None` when another flush holds the guard.
    async fn try_acquire_flush_lock(&self, ttl: Duration) -> AppResult<Option<FlushLease>>;

    async fn release_flush_lock(&self, lease: FlushLease) -> AppResult<()>;
}

fn hash_key(metric: CounterMetric) -> String {
    format!("counters:{}", metric.as_str())
}

fn lease_token() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn parse_hash(metric: CounterMetric, raw: HashMap<String, i64>) -> Vec<PendingDelta> {
        raw.into_iter()
            .filter_map(|(field, delta)| match Uuid::parse_str(&field) {
                Ok(recipe_id) if delta != 0 => Some(PendingDelta {
                    metric,
                    recipe_id,
                    delta,
                }),
                Ok(_) => None,
                Err(_) => {
                    tracing::warn!(%metric, field, "Dropping counter with malformed recipe id");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl EphemeralCounterStore for RedisCounterStore {
    async fn increment(
        &self,
        metric: CounterMetric,
        recipe_id: Uuid,
        delta: i64,
    ) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HINCRBY")
            .arg(hash_key(metric))
            .arg(recipe_id.to_string())
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending(&self, metric: CounterMetric, recipe_id: Uuid) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("HGET")
            .arg(hash_key(metric))
            .arg(recipe_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn drain(&self) -> AppResult<Vec<PendingDelta>> {
        let mut conn = self.conn.clone();
        let views_key = hash_key(CounterMetric::View);
        let likes_key = hash_key(CounterMetric::Like);

        let (views, likes): (HashMap<String, i64>, HashMap<String, i64>) = redis::pipe()
            .atomic()
            .cmd("HGETALL")
            .arg(&views_key)
            .cmd("HGETALL")
            .arg(&likes_key)
            .cmd("DEL")
            .arg(&views_key)
            .arg(&likes_key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let mut deltas = Self::parse_hash(CounterMetric::View, views);
        deltas.extend(Self::parse_hash(CounterMetric::Like, likes));
        Ok(deltas)
    }

    async fn try_acquire_flush_lock(&self, ttl: Duration) -> AppResult<Option<FlushLease>> {
        let mut conn = self.conn.clone();
        let token = lease_token();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(FLUSH_LOCK_KEY)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| FlushLease { token }))
    }

    async fn release_flush_lock(&self, lease: FlushLease) -> AppResult<()> {
        // Only delete the lock if it is still ours; an expired lease may have
        // been taken over by another flush.
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
            "#,
        );
        let mut conn = self.conn.clone();
        let released: i64 = script
            .key(FLUSH_LOCK_KEY)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            tracing::warn!("Flush lock expired before release");
        }
        Ok(())
    }
}

/// In-process buffer backed by a moka cache.
///
/// Upserts and removals are atomic per key, which is all the drain needs.
/// The cache holds at most `max_capacity` (metric, recipe) keys; past that moka
/// evicts entries and their pending deltas are lost. Flushing often enough to
/// stay below the cap is the operator's job; drains warn when it gets close.
#[derive(Clone)]
pub struct MokaCounterStore {
    counters: Cache<(CounterMetric, Uuid), i64>,
    max_capacity: u64,
    flushing: Arc<AtomicBool>,
}

impl MokaCounterStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            counters: Cache::builder().max_capacity(max_capacity).build(),
            max_capacity,
            flushing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True at 90% of capacity or more.
    pub async fn near_capacity(&self) -> bool {
        self.counters.run_pending_tasks().await;
        self.counters.entry_count() >= self.max_capacity - self.max_capacity / 10
    }
}

impl Default for MokaCounterStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl EphemeralCounterStore for MokaCounterStore {
    async fn increment(
        &self,
        metric: CounterMetric,
        recipe_id: Uuid,
        delta: i64,
    ) -> AppResult<()> {
        self.counters
            .entry((metric, recipe_id))
            .and_upsert_with(|existing| {
                let current = existing.map(|entry| entry.into_value()).unwrap_or(0);
                std::future::ready(current + delta)
            })
            .await;
        Ok(())
    }

    async fn pending(&self, metric: CounterMetric, recipe_id: Uuid) -> AppResult<i64> {
        Ok(self.counters.get(&(metric, recipe_id)).await.unwrap_or(0))
    }

    async fn drain(&self) -> AppResult<Vec<PendingDelta>> {
        if self.near_capacity().await {
            tracing::warn!(
                entries = self.counters.entry_count(),
                max_capacity = self.max_capacity,
                "In-process counter buffer is near capacity; evicted keys lose their deltas"
            );
        }
        let keys: Vec<(CounterMetric, Uuid)> =
            self.counters.iter().map(|(key, _)| *key).collect();

        let mut deltas = Vec::with_capacity(keys.len());
        for (metric, recipe_id) in keys {
            if let Some(delta) = self.counters.remove(&(metric, recipe_id)).await {
                if delta != 0 {
                    deltas.push(PendingDelta {
                        metric,
                        recipe_id,
                        delta,
                    });
                }
            }
        }
        Ok(deltas)
    }

    async fn try_acquire_flush_lock(&self, _ttl: Duration) -> AppResult<Option<FlushLease>> {
        match self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(Some(FlushLease {
                token: lease_token(),
            })),
            Err(_) => Ok(None),
        }
    }

    async fn release_flush_lock(&self, _lease: FlushLease) -> AppResult<()> {
        self.flushing.store(false, Ordering::Release);
        Ok(())
    }
}

/// Picks the Redis buffer when a URL is configured.
pub async fn connect(redis_url: Option<&str>) -> AppResult<Arc<dyn EphemeralCounterStore>> {
    match redis_url {
        Some(url) => {
            tracing::info!("Using Redis counter buffer");
            Ok(Arc::new(RedisCounterStore::connect(url).await?))
        }
        None => {
            tracing::warn!("REDIS_URL not set, buffering counters in-process");
            Ok(Arc::new(MokaCounterStore::default()))
        }
    }
}
