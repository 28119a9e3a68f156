//! Store backends.
//!
//! Each method on [`QueueStore`] and [`TaskStore`] is one indivisible
//! operation against the store: a Lua script on Redis, a single critical
//! section in memory. Callers never compose them into read-modify-write
//! sequences, so no distributed lock is needed.
//!
//! - [`RedisStore`]: production backend over `redis::aio::ConnectionManager`
//! - [`MemoryStore`]: in-process emulation with the same key layout, for
//!   tests and single-process use

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::keys::{QueueKeys, TaskKeys};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A message id with its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Where the ids handed to `unack` ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnackOutcome {
    /// Ids pushed back onto the main queue.
    pub requeued: Vec<String>,
    /// Ids that exhausted their retry budget.
    pub dead_lettered: Vec<String>,
}

/// Result of a queue timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sweep {
    /// Expired ids pushed back onto the main queue.
    pub requeued: usize,
    /// Expired ids that exhausted their retry budget.
    pub dead_lettered: usize,
    /// Nearest remaining in-flight deadline.
    pub next: Option<i64>,
}

/// Point-in-time sizes of a queue's structures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Ids waiting in the main queue.
    pub pending: usize,
    /// Ids popped but not yet acknowledged.
    pub in_flight: usize,
    /// Ids in the dead-letter set.
    pub dead_lettered: usize,
    /// Entries in the payload map.
    pub payloads: usize,
}

impl QueueStats {
    /// Ids that are still live (waiting or in flight).
    pub fn live(&self) -> usize {
        self.pending + self.in_flight
    }
}

/// A dead-lettered id and the epoch millis it was moved there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub dead_at: i64,
}

/// Result of a promotion sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Promotion {
    /// Entries moved from the schedule into the ready queue.
    pub moved: usize,
    /// Earliest remaining schedule score.
    pub next: Option<i64>,
}

/// A task popped from the ready queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: String,
    /// `None` when the payload entry vanished (for example a racing cancel).
    pub payload: Option<Vec<u8>>,
}

/// Outcome of returning a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRetry {
    /// Put back on the schedule at the retry time.
    Rescheduled,
    /// Moved to the dead set because the retry budget ran out.
    DeadLettered,
    /// The task was no longer in flight; nothing changed.
    NotInFlight,
    /// The id was offered again while it ran; the new entry stays as is.
    Superseded,
}

/// Point-in-time sizes of a task engine's structures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub scheduled: usize,
    pub ready: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// A live channel subscription.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Waits for the next message. `None` means the subscription was lost
    /// and must be re-established.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

/// Publish/subscribe side of a store.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Atomic operations backing an acknowledged queue.
#[async_trait]
pub trait QueueStore: PubSub {
    /// Stores the payloads, pushes the ids at the queue head and publishes a
    /// `message` event per id, all in one transaction.
    async fn push(&self, keys: &QueueKeys, entries: &[(String, Vec<u8>)])
        -> Result<(), StoreError>;

    /// Moves up to `count` ids from the queue tail into the in-flight set
    /// with `deadline`, then returns them with their payloads in pop order.
    async fn pop(
        &self,
        keys: &QueueKeys,
        count: usize,
        deadline: i64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Moves one specific queued id into the in-flight set.
    async fn pop_id(
        &self,
        keys: &QueueKeys,
        id: &str,
        deadline: i64,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Purges in-flight ids; returns the ids that were actually in flight.
    async fn ack(&self, keys: &QueueKeys, ids: &[String]) -> Result<Vec<String>, StoreError>;

    /// Returns in-flight ids to the queue or dead-letters them.
    async fn unack(
        &self,
        keys: &QueueKeys,
        ids: &[String],
        now: i64,
        retry_budget: i64,
    ) -> Result<UnackOutcome, StoreError>;

    /// Applies the unack policy to up to `limit` expired in-flight ids and
    /// reports what moved along with the nearest remaining deadline.
    async fn sweep_timeouts(
        &self,
        keys: &QueueKeys,
        now: i64,
        limit: usize,
        retry_budget: i64,
    ) -> Result<Sweep, StoreError>;

    async fn queue_stats(&self, keys: &QueueKeys) -> Result<QueueStats, StoreError>;

    async fn retry_count(&self, keys: &QueueKeys, id: &str) -> Result<u32, StoreError>;

    /// Oldest dead letters first.
    async fn dead_letters(&self, keys: &QueueKeys, limit: usize)
        -> Result<Vec<DeadLetter>, StoreError>;

    /// Removes ids from the dead-letter set; returns how many were removed.
    async fn purge_dead_letters(&self, keys: &QueueKeys, ids: &[String])
        -> Result<usize, StoreError>;
}

/// Atomic operations backing a delayed task engine.
#[async_trait]
pub trait TaskStore: PubSub {
    /// Upserts a scheduled task. Returns `true` when it became the earliest
    /// entry (a schedule notification was published).
    async fn offer(
        &self,
        keys: &TaskKeys,
        task_id: &str,
        payload: &[u8],
        scheduled_at: i64,
    ) -> Result<bool, StoreError>;

    /// Removes a task that has not been picked up yet.
    async fn cancel(&self, keys: &TaskKeys, task_id: &str) -> Result<bool, StoreError>;

    /// Moves up to `limit` due entries into the ready queue.
    async fn promote(&self, keys: &TaskKeys, now: i64, limit: usize)
        -> Result<Promotion, StoreError>;

    /// Pops one ready task into the in-flight set with `deadline`.
    async fn claim(&self, keys: &TaskKeys, deadline: i64)
        -> Result<Option<ClaimedTask>, StoreError>;

    /// Removes a finished task from the in-flight set.
    ///
    /// The payload and retry counter are purged unless the id was offered
    /// again while it ran and is back on the schedule or the ready queue.
    async fn complete(&self, keys: &TaskKeys, task_id: &str) -> Result<(), StoreError>;

    /// Returns a failed in-flight task to the schedule at `retry_at`, or
    /// dead-letters it when the budget is spent. A task offered again while
    /// it ran keeps its new entry untouched.
    async fn retry(
        &self,
        keys: &TaskKeys,
        task_id: &str,
        now: i64,
        retry_at: i64,
        retry_budget: i64,
    ) -> Result<TaskRetry, StoreError>;

    /// Reschedules up to `limit` expired in-flight tasks at `retry_at` and
    /// returns the nearest remaining in-flight deadline. Expired ids that
    /// were offered again meanwhile only leave the in-flight set.
    async fn sweep_task_timeouts(
        &self,
        keys: &TaskKeys,
        now: i64,
        limit: usize,
        retry_at: i64,
        retry_budget: i64,
    ) -> Result<Option<i64>, StoreError>;

    async fn task_stats(&self, keys: &TaskKeys) -> Result<TaskStats, StoreError>;

    async fn task_retry_count(&self, keys: &TaskKeys, task_id: &str) -> Result<u32, StoreError>;
}
