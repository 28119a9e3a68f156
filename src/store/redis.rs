//! Redis store backend.
//!
//! Multi-step mutations run as Lua scripts (`store/lua/*.lua`), invoked with
//! EVALSHA and transparently reloaded on `NOSCRIPT`. Reads that need no
//! atomicity use plain commands. Subscriptions open a dedicated pub/sub
//! connection per channel, since a subscribed connection cannot issue other
//! commands.

use std::sync::OnceLock;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    ClaimedTask, DeadLetter, Promotion, PubSub, QueueStats, QueueStore, StoredMessage,
    Subscription, Sweep, TaskRetry, TaskStats, TaskStore, UnackOutcome,
};
use crate::error::StoreError;
use crate::keys::{QueueKeys, TaskKeys};

macro_rules! script {
    ($name:ident, $file:literal) => {
        fn $name() -> &'static Script {
            static SCRIPT: OnceLock<Script> = OnceLock::new();
            SCRIPT.get_or_init(|| Script::new(include_str!(concat!("lua/", $file))))
        }
    };
}

/// Inclusive ZRANGE stop index for the first `limit` members; `-1` (the
/// whole set) when `limit` does not fit an `isize`.
fn last_rank(limit: usize) -> isize {
    isize::try_from(limit).map_or(-1, |l| l - 1)
}

script!(queue_pop_script, "queue_pop.lua");
script!(queue_pop_id_script, "queue_pop_id.lua");
script!(queue_ack_script, "queue_ack.lua");
script!(queue_unack_script, "queue_unack.lua");
script!(queue_sweep_script, "queue_sweep.lua");
script!(task_offer_script, "task_offer.lua");
script!(task_cancel_script, "task_cancel.lua");
script!(task_promote_script, "task_promote.lua");
script!(task_claim_script, "task_claim.lua");
script!(task_complete_script, "task_complete.lua");
script!(task_retry_script, "task_retry.lua");
script!(task_sweep_script, "task_sweep.lua");

/// Redis-backed store.
///
/// Cloning is cheap; clones share the connection manager.
#[derive(Clone)]
pub struct RedisStore {
    /// Used to open dedicated pub/sub connections.
    client: ::redis::Client,
    /// Multiplexed command connection (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Connection` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self { client, redis })
    }

    /// Creates a store from an existing client and connection manager.
    ///
    /// Useful when sharing a connection with other components.
    pub fn from_connection(client: ::redis::Client, redis: ConnectionManager) -> Self {
        Self { client, redis }
    }

    async fn card(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(key).await?)
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();

        // Forward until either side goes away. Returning drops the pub/sub
        // connection, which unsubscribes.
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(channel = %name, "Subscription dropped");
                        return;
                    }
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!(channel = %name, "Pub/sub connection closed");
                            return;
                        };
                        match msg.get_payload::<String>() {
                            Ok(payload) => {
                                if tx.send(payload).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(channel = %name, error = %e, "Ignoring non-text notification");
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(channel, rx))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(
        &self,
        keys: &QueueKeys,
        entries: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.clone();

        // MULTI/EXEC: the whole batch becomes visible at once.
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (id, payload) in entries {
            pipe.hset(&keys.data, id, payload.as_slice())
                .ignore()
                .lpush(&keys.queue, id)
                .ignore()
                .publish(&keys.channel, format!("message:{}", id))
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn pop(
        &self,
        keys: &QueueKeys,
        count: usize,
        deadline: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let ids: Vec<String> = queue_pop_script()
            .key(&keys.queue)
            .key(&keys.timeout)
            .key(&keys.channel)
            .arg(deadline)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<Option<Vec<u8>>> = ::redis::cmd("HMGET")
            .arg(&keys.data)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut messages = Vec::with_capacity(ids.len());
        for (id, payload) in ids.into_iter().zip(payloads) {
            match payload {
                Some(payload) => messages.push(StoredMessage { id, payload }),
                None => warn!(queue = %keys.name, id = %id, "Popped id has no payload"),
            }
        }
        Ok(messages)
    }

    async fn pop_id(
        &self,
        keys: &QueueKeys,
        id: &str,
        deadline: i64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.redis.clone();
        let payload: Option<Vec<u8>> = queue_pop_id_script()
            .key(&keys.queue)
            .key(&keys.timeout)
            .key(&keys.data)
            .key(&keys.channel)
            .arg(deadline)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn ack(&self, keys: &QueueKeys, ids: &[String]) -> Result<Vec<String>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let acked: Vec<String> = queue_ack_script()
            .key(&keys.timeout)
            .key(&keys.data)
            .key(&keys.retry)
            .key(&keys.channel)
            .arg(ids)
            .invoke_async(&mut conn)
            .await?;
        Ok(acked)
    }

    async fn unack(
        &self,
        keys: &QueueKeys,
        ids: &[String],
        now: i64,
        retry_budget: i64,
    ) -> Result<UnackOutcome, StoreError> {
        if ids.is_empty() {
            return Ok(UnackOutcome::default());
        }

        let mut conn = self.redis.clone();
        let (requeued, dead_lettered): (Vec<String>, Vec<String>) = queue_unack_script()
            .key(&keys.timeout)
            .key(&keys.queue)
            .key(&keys.retry)
            .key(&keys.error)
            .key(&keys.channel)
            .key(&keys.data)
            .arg(now)
            .arg(retry_budget)
            .arg(ids)
            .invoke_async(&mut conn)
            .await?;

        Ok(UnackOutcome {
            requeued,
            dead_lettered,
        })
    }

    async fn sweep_timeouts(
        &self,
        keys: &QueueKeys,
        now: i64,
        limit: usize,
        retry_budget: i64,
    ) -> Result<Sweep, StoreError> {
        let mut conn = self.redis.clone();
        let (requeued, dead_lettered, next): (usize, usize, Option<i64>) = queue_sweep_script()
            .key(&keys.timeout)
            .key(&keys.queue)
            .key(&keys.retry)
            .key(&keys.error)
            .key(&keys.channel)
            .key(&keys.data)
            .arg(now)
            .arg(limit)
            .arg(retry_budget)
            .invoke_async(&mut conn)
            .await?;
        Ok(Sweep {
            requeued,
            dead_lettered,
            next,
        })
    }

    async fn queue_stats(&self, keys: &QueueKeys) -> Result<QueueStats, StoreError> {
        let mut conn = self.redis.clone();
        let (pending, in_flight, dead_lettered, payloads): (usize, usize, usize, usize) =
            ::redis::pipe()
                .llen(&keys.queue)
                .zcard(&keys.timeout)
                .zcard(&keys.error)
                .hlen(&keys.data)
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            pending,
            in_flight,
            dead_lettered,
            payloads,
        })
    }

    async fn retry_count(&self, keys: &QueueKeys, id: &str) -> Result<u32, StoreError> {
        let mut conn = self.redis.clone();
        let count: Option<u32> = conn.hget(&keys.retry, id).await?;
        Ok(count.unwrap_or(0))
    }

    async fn dead_letters(
        &self,
        keys: &QueueKeys,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(&keys.error, 0, last_rank(limit))
            .await?;

        Ok(entries
            .into_iter()
            .map(|(id, score)| DeadLetter {
                id,
                dead_at: score as i64,
            })
            .collect())
    }

    async fn purge_dead_letters(
        &self,
        keys: &QueueKeys,
        ids: &[String],
    ) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.redis.clone();
        let removed: usize = conn.zrem(&keys.error, ids).await?;
        Ok(removed)
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn offer(
        &self,
        keys: &TaskKeys,
        task_id: &str,
        payload: &[u8],
        scheduled_at: i64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let earliest: i64 = task_offer_script()
            .key(&keys.schedule)
            .key(&keys.data)
            .key(&keys.schedule_channel)
            .arg(scheduled_at)
            .arg(task_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(earliest == 1)
    }

    async fn cancel(&self, keys: &TaskKeys, task_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = task_cancel_script()
            .key(&keys.schedule)
            .key(&keys.ready)
            .key(&keys.data)
            .key(&keys.retry)
            .arg(task_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn promote(
        &self,
        keys: &TaskKeys,
        now: i64,
        limit: usize,
    ) -> Result<Promotion, StoreError> {
        let mut conn = self.redis.clone();
        let (moved, next): (usize, Option<i64>) = task_promote_script()
            .key(&keys.schedule)
            .key(&keys.ready)
            .key(&keys.task_channel)
            .arg(now)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(Promotion { moved, next })
    }

    async fn claim(
        &self,
        keys: &TaskKeys,
        deadline: i64,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut conn = self.redis.clone();
        let claimed: Option<(String, Option<Vec<u8>>)> = task_claim_script()
            .key(&keys.ready)
            .key(&keys.timeout)
            .key(&keys.data)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed.map(|(id, payload)| ClaimedTask { id, payload }))
    }

    async fn complete(&self, keys: &TaskKeys, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        task_complete_script()
            .key(&keys.timeout)
            .key(&keys.data)
            .key(&keys.retry)
            .key(&keys.schedule)
            .key(&keys.ready)
            .arg(task_id)
            .invoke_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        keys: &TaskKeys,
        task_id: &str,
        now: i64,
        retry_at: i64,
        retry_budget: i64,
    ) -> Result<TaskRetry, StoreError> {
        let mut conn = self.redis.clone();
        let outcome: i64 = task_retry_script()
            .key(&keys.timeout)
            .key(&keys.schedule)
            .key(&keys.retry)
            .key(&keys.error)
            .key(&keys.data)
            .key(&keys.schedule_channel)
            .key(&keys.ready)
            .arg(task_id)
            .arg(now)
            .arg(retry_at)
            .arg(retry_budget)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            0 => Ok(TaskRetry::NotInFlight),
            1 => Ok(TaskRetry::Rescheduled),
            2 => Ok(TaskRetry::DeadLettered),
            3 => Ok(TaskRetry::Superseded),
            other => Err(StoreError::Protocol(format!(
                "task retry script returned {}",
                other
            ))),
        }
    }

    async fn sweep_task_timeouts(
        &self,
        keys: &TaskKeys,
        now: i64,
        limit: usize,
        retry_at: i64,
        retry_budget: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.redis.clone();
        let next: Option<i64> = task_sweep_script()
            .key(&keys.timeout)
            .key(&keys.schedule)
            .key(&keys.retry)
            .key(&keys.error)
            .key(&keys.data)
            .key(&keys.schedule_channel)
            .key(&keys.ready)
            .arg(now)
            .arg(limit)
            .arg(retry_at)
            .arg(retry_budget)
            .invoke_async(&mut conn)
            .await?;
        Ok(next)
    }

    async fn task_stats(&self, keys: &TaskKeys) -> Result<TaskStats, StoreError> {
        let mut conn = self.redis.clone();
        let ready: usize = conn.llen(&keys.ready).await?;
        let (scheduled, in_flight, dead_lettered) = tokio::try_join!(
            self.card(&keys.schedule),
            self.card(&keys.timeout),
            self.card(&keys.error)
        )?;

        Ok(TaskStats {
            scheduled,
            ready,
            in_flight,
            dead_lettered,
        })
    }

    async fn task_retry_count(&self, keys: &TaskKeys, task_id: &str) -> Result<u32, StoreError> {
        let mut conn = self.redis.clone();
        let count: Option<u32> = conn.hget(&keys.retry, task_id).await?;
        Ok(count.unwrap_or(0))
    }
}
