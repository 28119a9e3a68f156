//! In-memory store backend.
//!
//! Emulates the Redis structures (lists, sorted sets, hashes, pub/sub) under
//! the same key names, and applies each operation inside one critical section
//! so it is as indivisible as its Lua counterpart. State lives only as long
//! as the store, which makes it suited to tests and single-process use.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    ClaimedTask, DeadLetter, Promotion, PubSub, QueueStats, QueueStore, StoredMessage,
    Subscription, Sweep, TaskRetry, TaskStats, TaskStore, UnackOutcome,
};
use crate::error::StoreError;
use crate::keys::{QueueKeys, TaskKeys};

/// Sorted set ordered by score, then member, like Redis.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: i64) {
        self.scores.insert(member.to_string(), score);
    }

    fn remove(&mut self, member: &str) -> bool {
        self.scores.remove(member).is_some()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    fn ordered(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> =
            self.scores.iter().map(|(m, s)| (m.clone(), *s)).collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn first(&self) -> Option<(String, i64)> {
        self.scores
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(m, s)| (m.clone(), *s))
    }

    /// Members with `score <= max`, lowest first, at most `limit`.
    fn due(&self, max: i64, limit: usize) -> Vec<String> {
        self.ordered()
            .into_iter()
            .filter(|(_, s)| *s <= max)
            .take(limit)
            .map(|(m, _)| m)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, SortedSet>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    counters: HashMap<String, HashMap<String, i64>>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

impl Keyspace {
    fn list(&mut self, key: &str) -> &mut VecDeque<String> {
        self.lists.entry(key.to_string()).or_default()
    }

    fn zset(&mut self, key: &str) -> &mut SortedSet {
        self.zsets.entry(key.to_string()).or_default()
    }

    fn hash(&mut self, key: &str) -> &mut HashMap<String, Vec<u8>> {
        self.hashes.entry(key.to_string()).or_default()
    }

    fn counter(&mut self, key: &str) -> &mut HashMap<String, i64> {
        self.counters.entry(key.to_string()).or_default()
    }

    fn first(&self, key: &str) -> Option<(String, i64)> {
        self.zsets.get(key).and_then(SortedSet::first)
    }

    fn retries(&self, key: &str, id: &str) -> i64 {
        self.counters
            .get(key)
            .and_then(|c| c.get(id))
            .copied()
            .unwrap_or(0)
    }

    fn incr(&mut self, key: &str, id: &str) {
        *self.counter(key).entry(id.to_string()).or_insert(0) += 1;
    }

    fn publish(&mut self, channel: &str, message: String) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }

    /// Shared retry policy: a negative budget never dead-letters, zero always
    /// does, otherwise the id is dead once it was retried `budget` times.
    fn exhausted(&self, retry_key: &str, id: &str, budget: i64) -> bool {
        match budget {
            b if b < 0 => false,
            0 => true,
            b => self.retries(retry_key, id) >= b,
        }
    }

    /// Requeues or dead-letters an id that just left the in-flight set.
    fn settle(&mut self, keys: &QueueKeys, id: &str, now: i64, budget: i64) -> bool {
        if self.exhausted(&keys.retry, id, budget) {
            self.zset(&keys.error).add(id, now);
            self.hash(&keys.data).remove(id);
            self.counter(&keys.retry).remove(id);
            self.publish(&keys.channel, format!("error:{}", id));
            false
        } else {
            self.list(&keys.queue).push_front(id.to_string());
            self.incr(&keys.retry, id);
            self.publish(&keys.channel, format!("message:{}", id));
            true
        }
    }

    /// Whether `id` was offered again and is waiting to run as a new entry.
    fn superseded(&self, keys: &TaskKeys, id: &str) -> bool {
        self.zsets
            .get(&keys.schedule)
            .is_some_and(|schedule| schedule.contains(id))
            || self
                .lists
                .get(&keys.ready)
                .is_some_and(|ready| ready.iter().any(|r| r == id))
    }

    fn forget_task(&mut self, keys: &TaskKeys, id: &str) {
        self.hash(&keys.data).remove(id);
        self.counter(&keys.retry).remove(id);
    }
}

/// Store that keeps everything in process memory.
///
/// Clones share state, so a clone behaves like a second connection to the
/// same server.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Keyspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`, like `PUBSUB NUMSUB`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut ks = self.lock();
        match ks.channels.get_mut(channel) {
            Some(subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            }
            None => 0,
        }
    }

    /// Publishes a raw message, as another process would.
    pub fn publish(&self, channel: &str, message: impl Into<String>) {
        self.lock().publish(channel, message.into());
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        // A panic while holding the lock cannot leave a half-applied
        // operation behind any more than a crashed Redis client could.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(
        &self,
        keys: &QueueKeys,
        entries: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError> {
        let mut ks = self.lock();
        for (id, payload) in entries {
            ks.hash(&keys.data).insert(id.clone(), payload.clone());
            ks.list(&keys.queue).push_front(id.clone());
            ks.publish(&keys.channel, format!("message:{}", id));
        }
        Ok(())
    }

    async fn pop(
        &self,
        keys: &QueueKeys,
        count: usize,
        deadline: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut ks = self.lock();
        let mut ids = Vec::new();
        while ids.len() < count {
            let Some(id) = ks.list(&keys.queue).pop_back() else {
                break;
            };
            ks.zset(&keys.timeout).add(&id, deadline);
            ids.push(id);
        }

        if !ids.is_empty() {
            if let Some((_, nearest)) = ks.first(&keys.timeout) {
                if deadline <= nearest {
                    ks.publish(&keys.channel, format!("timeout:{}", deadline));
                }
            }
        }

        let data = ks.hash(&keys.data);
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let payload = data.get(&id)?.clone();
                Some(StoredMessage { id, payload })
            })
            .collect())
    }

    async fn pop_id(
        &self,
        keys: &QueueKeys,
        id: &str,
        deadline: i64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut ks = self.lock();
        let queue = ks.list(&keys.queue);
        // LREM with a negative count scans from the tail.
        let Some(pos) = queue.iter().rposition(|queued| queued == id) else {
            return Ok(None);
        };
        queue.remove(pos);

        ks.zset(&keys.timeout).add(id, deadline);
        if let Some((_, nearest)) = ks.first(&keys.timeout) {
            ks.publish(&keys.channel, format!("timeout:{}", nearest));
        }
        Ok(ks.hash(&keys.data).get(id).cloned())
    }

    async fn ack(&self, keys: &QueueKeys, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let mut ks = self.lock();
        let before = ks.first(&keys.timeout).map(|(_, s)| s);

        let mut acked = Vec::new();
        for id in ids {
            if ks.zset(&keys.timeout).remove(id) {
                ks.hash(&keys.data).remove(id);
                ks.counter(&keys.retry).remove(id);
                acked.push(id.clone());
            }
        }

        if let Some((_, after)) = ks.first(&keys.timeout) {
            if Some(after) != before {
                ks.publish(&keys.channel, format!("timeout:{}", after));
            }
        }
        Ok(acked)
    }

    async fn unack(
        &self,
        keys: &QueueKeys,
        ids: &[String],
        now: i64,
        retry_budget: i64,
    ) -> Result<UnackOutcome, StoreError> {
        let mut ks = self.lock();
        let mut outcome = UnackOutcome::default();
        for id in ids {
            if !ks.zset(&keys.timeout).remove(id) {
                continue;
            }
            if ks.settle(keys, id, now, retry_budget) {
                outcome.requeued.push(id.clone());
            } else {
                outcome.dead_lettered.push(id.clone());
            }
        }
        Ok(outcome)
    }

    async fn sweep_timeouts(
        &self,
        keys: &QueueKeys,
        now: i64,
        limit: usize,
        retry_budget: i64,
    ) -> Result<Sweep, StoreError> {
        let mut ks = self.lock();
        let expired = ks.zset(&keys.timeout).due(now, limit);
        let mut sweep = Sweep::default();
        for id in &expired {
            ks.zset(&keys.timeout).remove(id);
            if ks.settle(keys, id, now, retry_budget) {
                sweep.requeued += 1;
            } else {
                sweep.dead_lettered += 1;
            }
        }
        sweep.next = ks.first(&keys.timeout).map(|(_, s)| s);
        Ok(sweep)
    }

    async fn queue_stats(&self, keys: &QueueKeys) -> Result<QueueStats, StoreError> {
        let ks = self.lock();
        Ok(QueueStats {
            pending: ks.lists.get(&keys.queue).map_or(0, VecDeque::len),
            in_flight: ks.zsets.get(&keys.timeout).map_or(0, SortedSet::len),
            dead_lettered: ks.zsets.get(&keys.error).map_or(0, SortedSet::len),
            payloads: ks.hashes.get(&keys.data).map_or(0, HashMap::len),
        })
    }

    async fn retry_count(&self, keys: &QueueKeys, id: &str) -> Result<u32, StoreError> {
        let retries = self.lock().retries(&keys.retry, id);
        Ok(u32::try_from(retries).unwrap_or(u32::MAX))
    }

    async fn dead_letters(
        &self,
        keys: &QueueKeys,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let ks = self.lock();
        Ok(ks
            .zsets
            .get(&keys.error)
            .map(SortedSet::ordered)
            .unwrap_or_default()
            .into_iter()
            .take(limit)
            .map(|(id, dead_at)| DeadLetter { id, dead_at })
            .collect())
    }

    async fn purge_dead_letters(
        &self,
        keys: &QueueKeys,
        ids: &[String],
    ) -> Result<usize, StoreError> {
        let mut ks = self.lock();
        let errors = ks.zset(&keys.error);
        Ok(ids.iter().filter(|id| errors.remove(id)).count())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn offer(
        &self,
        keys: &TaskKeys,
        task_id: &str,
        payload: &[u8],
        scheduled_at: i64,
    ) -> Result<bool, StoreError> {
        let mut ks = self.lock();
        ks.zset(&keys.schedule).add(task_id, scheduled_at);
        ks.hash(&keys.data)
            .insert(task_id.to_string(), payload.to_vec());

        let earliest = ks
            .first(&keys.schedule)
            .is_some_and(|(first, _)| first == task_id);
        if earliest {
            ks.publish(&keys.schedule_channel, scheduled_at.to_string());
        }
        Ok(earliest)
    }

    async fn cancel(&self, keys: &TaskKeys, task_id: &str) -> Result<bool, StoreError> {
        let mut ks = self.lock();
        let mut removed = ks.zset(&keys.schedule).remove(task_id);
        if !removed {
            let ready = ks.list(&keys.ready);
            let before = ready.len();
            ready.retain(|id| id != task_id);
            removed = ready.len() != before;
        }
        if removed {
            ks.forget_task(keys, task_id);
        }
        Ok(removed)
    }

    async fn promote(
        &self,
        keys: &TaskKeys,
        now: i64,
        limit: usize,
    ) -> Result<Promotion, StoreError> {
        let mut ks = self.lock();
        let due = ks.zset(&keys.schedule).due(now, limit);
        for id in &due {
            ks.zset(&keys.schedule).remove(id);
            ks.list(&keys.ready).push_back(id.clone());
        }
        if !due.is_empty() {
            ks.publish(&keys.task_channel, due.len().to_string());
        }
        Ok(Promotion {
            moved: due.len(),
            next: ks.first(&keys.schedule).map(|(_, s)| s),
        })
    }

    async fn claim(
        &self,
        keys: &TaskKeys,
        deadline: i64,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut ks = self.lock();
        let Some(id) = ks.list(&keys.ready).pop_front() else {
            return Ok(None);
        };
        ks.zset(&keys.timeout).add(&id, deadline);
        let payload = ks.hash(&keys.data).get(&id).cloned();
        Ok(Some(ClaimedTask { id, payload }))
    }

    async fn complete(&self, keys: &TaskKeys, task_id: &str) -> Result<(), StoreError> {
        let mut ks = self.lock();
        ks.zset(&keys.timeout).remove(task_id);
        if !ks.superseded(keys, task_id) {
            ks.forget_task(keys, task_id);
        }
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
        let mut ks = self.lock();
        if !ks.zset(&keys.timeout).remove(task_id) {
            return Ok(TaskRetry::NotInFlight);
        }
        if ks.superseded(keys, task_id) {
            return Ok(TaskRetry::Superseded);
        }

        if ks.exhausted(&keys.retry, task_id, retry_budget) {
            ks.zset(&keys.error).add(task_id, now);
            ks.forget_task(keys, task_id);
            return Ok(TaskRetry::DeadLettered);
        }

        ks.zset(&keys.schedule).add(task_id, retry_at);
        ks.incr(&keys.retry, task_id);
        if ks
            .first(&keys.schedule)
            .is_some_and(|(first, _)| first == task_id)
        {
            ks.publish(&keys.schedule_channel, retry_at.to_string());
        }
        Ok(TaskRetry::Rescheduled)
    }

    async fn sweep_task_timeouts(
        &self,
        keys: &TaskKeys,
        now: i64,
        limit: usize,
        retry_at: i64,
        retry_budget: i64,
    ) -> Result<Option<i64>, StoreError> {
        let mut ks = self.lock();
        let expired = ks.zset(&keys.timeout).due(now, limit);
        let mut rescheduled = false;
        for id in &expired {
            ks.zset(&keys.timeout).remove(id);
            if ks.superseded(keys, id) {
                continue;
            }
            if ks.exhausted(&keys.retry, id, retry_budget) {
                ks.zset(&keys.error).add(id, now);
                ks.forget_task(keys, id);
            } else {
                ks.zset(&keys.schedule).add(id, retry_at);
                ks.incr(&keys.retry, id);
                rescheduled = true;
            }
        }

        if rescheduled && ks.first(&keys.schedule).is_some_and(|(_, s)| s == retry_at) {
            ks.publish(&keys.schedule_channel, retry_at.to_string());
        }
        Ok(ks.first(&keys.timeout).map(|(_, s)| s))
    }

    async fn task_stats(&self, keys: &TaskKeys) -> Result<TaskStats, StoreError> {
        let ks = self.lock();
        let card = |key: &str| ks.zsets.get(key).map_or(0, SortedSet::len);
        Ok(TaskStats {
            scheduled: card(&keys.schedule),
            ready: ks.lists.get(&keys.ready).map_or(0, VecDeque::len),
            in_flight: card(&keys.timeout),
            dead_lettered: card(&keys.error),
        })
    }

    async fn task_retry_count(&self, keys: &TaskKeys, task_id: &str) -> Result<u32, StoreError> {
        let retries = self.lock().retries(&keys.retry, task_id);
        Ok(u32::try_from(retries).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(ids: &[&str]) -> Vec<(String, Vec<u8>)> {
        ids.iter()
            .map(|id| (id.to_string(), format!("payload-{}", id).into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("fifo");

        store.push(&keys, &entries(&["a", "b", "c"])).await.unwrap();
        let popped = store.pop(&keys, 2, 1_000).await.unwrap();

        let ids: Vec<_> = popped.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(popped[0].payload, b"payload-a");

        let stats = store.queue_stats(&keys).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 2);
        assert_eq!(stats.payloads, 3);
    }

    #[tokio::test]
    async fn test_ack_ignores_ids_not_in_flight() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("ack");

        store.push(&keys, &entries(&["a", "b"])).await.unwrap();
        store.pop(&keys, 1, 1_000).await.unwrap();

        let acked = store
            .ack(&keys, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(acked, ["a"]);

        let stats = store.queue_stats(&keys).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.payloads, 1);
    }

    #[tokio::test]
    async fn test_unack_policy() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("policy");
        store.push(&keys, &entries(&["a"])).await.unwrap();

        store.pop(&keys, 1, 1_000).await.unwrap();
        let outcome = store.unack(&keys, &["a".to_string()], 10, 1).await.unwrap();
        assert_eq!(outcome.requeued, ["a"]);
        assert_eq!(store.retry_count(&keys, "a").await.unwrap(), 1);

        store.pop(&keys, 1, 1_000).await.unwrap();
        let outcome = store.unack(&keys, &["a".to_string()], 20, 1).await.unwrap();
        assert_eq!(outcome.dead_lettered, ["a"]);

        let dead = store.dead_letters(&keys, 10).await.unwrap();
        assert_eq!(dead, [DeadLetter { id: "a".into(), dead_at: 20 }]);
        assert_eq!(store.retry_count(&keys, "a").await.unwrap(), 0);
        assert_eq!(store.queue_stats(&keys).await.unwrap().payloads, 0);
    }

    #[tokio::test]
    async fn test_sweep_returns_nearest_remaining_deadline() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("sweep");
        store.push(&keys, &entries(&["a", "b"])).await.unwrap();
        store.pop(&keys, 1, 100).await.unwrap();
        store.pop(&keys, 1, 500).await.unwrap();

        let sweep = store.sweep_timeouts(&keys, 200, 10, -1).await.unwrap();
        assert_eq!(
            sweep,
            Sweep {
                requeued: 1,
                dead_lettered: 0,
                next: Some(500)
            }
        );

        let stats = store.queue_stats(&keys).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn test_pop_publishes_nearer_deadline() {
        let store = MemoryStore::new();
        let keys = QueueKeys::new("notify");
        let mut sub = store.subscribe(&keys.channel).await.unwrap();

        store.push(&keys, &entries(&["a"])).await.unwrap();
        store.pop(&keys, 1, 42).await.unwrap();

        assert_eq!(sub.recv().await.as_deref(), Some("message:a"));
        assert_eq!(sub.recv().await.as_deref(), Some("timeout:42"));
    }

    #[tokio::test]
    async fn test_task_offer_promote_claim() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("tasks");

        assert!(store.offer(&keys, "late", b"l", 200).await.unwrap());
        assert!(store.offer(&keys, "early", b"e", 100).await.unwrap());
        assert!(!store.offer(&keys, "later", b"x", 300).await.unwrap());

        let promotion = store.promote(&keys, 250, 10).await.unwrap();
        assert_eq!(promotion, Promotion { moved: 2, next: Some(300) });

        let first = store.claim(&keys, 1_000).await.unwrap().unwrap();
        assert_eq!(first.id, "early");
        assert_eq!(first.payload.as_deref(), Some(&b"e"[..]));
    }

    #[tokio::test]
    async fn test_task_cancel_only_before_claim() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("cancel");
        store.offer(&keys, "a", b"a", 100).await.unwrap();
        store.offer(&keys, "b", b"b", 100).await.unwrap();
        store.promote(&keys, 100, 1).await.unwrap();

        // "a" is ready, "b" is still scheduled.
        assert!(store.cancel(&keys, "a").await.unwrap());
        assert!(store.cancel(&keys, "b").await.unwrap());
        assert!(!store.cancel(&keys, "b").await.unwrap());
        assert_eq!(store.task_stats(&keys).await.unwrap(), TaskStats::default());
    }

    #[tokio::test]
    async fn test_task_retry_budget() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("retry");
        store.offer(&keys, "t", b"t", 0).await.unwrap();

        store.promote(&keys, 0, 10).await.unwrap();
        store.claim(&keys, 50).await.unwrap();
        let outcome = store.retry(&keys, "t", 10, 20, 1).await.unwrap();
        assert_eq!(outcome, TaskRetry::Rescheduled);

        store.promote(&keys, 20, 10).await.unwrap();
        store.claim(&keys, 50).await.unwrap();
        let outcome = store.retry(&keys, "t", 30, 40, 1).await.unwrap();
        assert_eq!(outcome, TaskRetry::DeadLettered);

        let outcome = store.retry(&keys, "t", 30, 40, 1).await.unwrap();
        assert_eq!(outcome, TaskRetry::NotInFlight);
    }

    #[tokio::test]
    async fn test_reoffer_while_running_keeps_new_payload() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("reoffer");
        store.offer(&keys, "t", b"old", 0).await.unwrap();
        store.promote(&keys, 0, 10).await.unwrap();
        store.claim(&keys, 50).await.unwrap();

        store.offer(&keys, "t", b"new", 1_000).await.unwrap();
        store.complete(&keys, "t").await.unwrap();

        store.promote(&keys, 1_000, 10).await.unwrap();
        let task = store.claim(&keys, 2_000).await.unwrap().unwrap();
        assert_eq!(task.payload.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_reoffered_entry_alone() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("reoffer-fail");
        store.offer(&keys, "t", b"old", 0).await.unwrap();
        store.promote(&keys, 0, 10).await.unwrap();
        store.claim(&keys, 50).await.unwrap();
        store.offer(&keys, "t", b"new", 1_000).await.unwrap();

        let outcome = store.retry(&keys, "t", 10, 20, 0).await.unwrap();
        assert_eq!(outcome, TaskRetry::Superseded);

        let promotion = store.promote(&keys, 500, 10).await.unwrap();
        assert_eq!(promotion, Promotion { moved: 0, next: Some(1_000) });
        let stats = store.task_stats(&keys).await.unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_task_timeout_sweep_reschedules_and_dead_letters() {
        let store = MemoryStore::new();
        let keys = TaskKeys::new("task-sweep");
        store.offer(&keys, "a", b"a", 0).await.unwrap();
        store.offer(&keys, "b", b"b", 0).await.unwrap();
        store.promote(&keys, 0, 10).await.unwrap();
        store.claim(&keys, 100).await.unwrap();
        store.claim(&keys, 400).await.unwrap();

        // Only "a" has expired at 200.
        let next = store.sweep_task_timeouts(&keys, 200, 10, 300, 1).await.unwrap();
        assert_eq!(next, Some(400));
        assert_eq!(store.task_retry_count(&keys, "a").await.unwrap(), 1);
        let promotion = store.promote(&keys, 300, 10).await.unwrap();
        assert_eq!(promotion.moved, 1);

        // Second expiry of "a" exhausts a budget of one; "b" is rescheduled.
        store.claim(&keys, 350).await.unwrap();
        let next = store.sweep_task_timeouts(&keys, 500, 10, 900, 1).await.unwrap();
        assert_eq!(next, None);

        let stats = store.task_stats(&keys).await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(store.task_retry_count(&keys, "a").await.unwrap(), 0);
        assert_eq!(store.task_retry_count(&keys, "b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_dropped_subscriptions() {
        let store = MemoryStore::new();
        let first = store.subscribe("chan").await.unwrap();
        let _second = store.subscribe("chan").await.unwrap();
        assert_eq!(store.subscriber_count("chan"), 2);

        drop(first);
        assert_eq!(store.subscriber_count("chan"), 1);
        assert_eq!(store.subscriber_count("other"), 0);
    }
}
