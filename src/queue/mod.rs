//! Acknowledged work queue.
//!
//! At-least-once delivery on top of a [`QueueStore`]: a popped message stays
//! invisible until it is acknowledged, returned with `unack`, or its
//! visibility timeout passes. Returned and timed-out messages are requeued
//! until the retry budget is spent, then dead-lettered.
//!
//! # Features
//!
//! - Batched, atomic push and pop
//! - Targeted pop of a specific id
//! - Visibility-timeout redelivery driven by channel notifications
//! - Bounded retries with a dead-letter set
//! - A worker pool that runs a handler per message

pub mod listener;
pub mod worker_pool;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};
use crate::config::QueueConfig;
use crate::driver::Driver;
use crate::error::QueueError;
use crate::keys::QueueKeys;
use crate::metrics::{MessageOutcome, MetricsCollector};
use crate::store::{DeadLetter, QueueStats, QueueStore, StoredMessage, UnackOutcome};
use crate::task::TaskRegistry;
use crate::utils::{deadline_after, now_millis};

pub use listener::{ListenerGuard, LoggingEvents, QueueEvents};
pub use worker_pool::{
    MessageHandler, PoolError, PoolStats, WorkerPool, WorkerPoolConfig,
};

/// A delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub id: String,
    pub payload: T,
}

/// An acknowledged queue of `T` values stored with codec `C`.
pub struct AckQueue<T, C = JsonCodec<T>> {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    config: QueueConfig,
    codec: C,
    registry: Arc<TaskRegistry>,
    metrics: MetricsCollector,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AckQueue<T, JsonCodec<T>>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Opens the queue `name` with JSON payloads and default policy.
    pub fn new(store: Arc<dyn QueueStore>, name: &str) -> Self {
        Self::with_codec(store, name, JsonCodec::new())
    }
}

impl<T, C: Codec<T>> AckQueue<T, C> {
    pub fn with_codec(store: Arc<dyn QueueStore>, name: &str, codec: C) -> Self {
        Self {
            store,
            keys: QueueKeys::new(name),
            config: QueueConfig::default(),
            codec,
            registry: TaskRegistry::global(),
            metrics: MetricsCollector::new(),
            _marker: PhantomData,
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Places the queue's keys under `prefix` instead of the default.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.keys = QueueKeys::with_prefix(prefix, &self.keys.name);
        self
    }

    /// Uses `registry` instead of the process-wide one for listeners.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn name(&self) -> &str {
        &self.keys.name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Pushes payloads under fresh UUIDs.
    ///
    /// The whole batch is stored atomically. Returns the ids in input order.
    ///
    /// # Errors
    ///
    /// Returns `QueueError` if a payload cannot be encoded or the store fails;
    /// nothing is stored in either case.
    pub async fn push(&self, payloads: &[T]) -> Result<Vec<String>, QueueError> {
        let entries = payloads
            .iter()
            .map(|payload| -> Result<(String, Vec<u8>), QueueError> {
                Ok((Uuid::new_v4().to_string(), self.codec.encode(payload)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.push_entries(entries).await
    }

    pub async fn push_one(&self, payload: &T) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let entry = (id.clone(), self.codec.encode(payload)?);
        self.push_entries(vec![entry]).await?;
        Ok(id)
    }

    /// Pushes payloads under caller-chosen ids.
    ///
    /// Pushing an id that is still queued or in flight stores a second copy
    /// of it; callers choosing their own ids must keep them unique.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidArgument` for an empty id.
    pub async fn push_with_ids(&self, messages: &[(String, T)]) -> Result<Vec<String>, QueueError> {
        let mut entries = Vec::with_capacity(messages.len());
        for (id, payload) in messages {
            if id.is_empty() {
                return Err(QueueError::InvalidArgument(
                    "message id must not be empty".to_string(),
                ));
            }
            entries.push((id.clone(), self.codec.encode(payload)?));
        }
        self.push_entries(entries).await
    }

    async fn push_entries(&self, entries: Vec<(String, Vec<u8>)>) -> Result<Vec<String>, QueueError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        self.store.push(&self.keys, &entries).await?;
        self.metrics
            .record_messages(&self.keys.name, MessageOutcome::Pushed, entries.len());
        debug!(queue = %self.keys.name, count = entries.len(), "Pushed messages");

        Ok(entries.into_iter().map(|(id, _)| id).collect())
    }

    /// Pops up to `count` messages and starts their visibility timeout.
    ///
    /// Fewer messages than requested means the queue is drained for now.
    /// Messages whose payload cannot be decoded are dead-lettered right away
    /// and left out of the result; the rest of the batch is still returned.
    pub async fn pop(&self, count: usize) -> Result<Vec<Message<T>>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = deadline_after(self.config.visibility_timeout);
        let stored = self.store.pop(&self.keys, count, deadline).await?;
        self.metrics
            .record_messages(&self.keys.name, MessageOutcome::Popped, stored.len());

        let mut messages = Vec::with_capacity(stored.len());
        let mut undecodable = Vec::new();
        for StoredMessage { id, payload } in stored {
            match self.codec.decode(&payload) {
                Ok(payload) => messages.push(Message { id, payload }),
                Err(e) => {
                    warn!(queue = %self.keys.name, id = %id, error = %e, "Undecodable message");
                    undecodable.push(id);
                }
            }
        }
        if !undecodable.is_empty() {
            self.dead_letter_undecodable(&undecodable).await;
        }
        Ok(messages)
    }

    /// Moves popped ids that no consumer can ever decode to the dead-letter
    /// set. On failure they stay in flight and the timeout sweep retries them.
    async fn dead_letter_undecodable(&self, ids: &[String]) {
        match self.store.unack(&self.keys, ids, now_millis(), 0).await {
            Ok(outcome) => {
                self.metrics.record_messages(
                    &self.keys.name,
                    MessageOutcome::DeadLettered,
                    outcome.dead_lettered.len(),
                );
                warn!(
                    queue = %self.keys.name,
                    ids = ?outcome.dead_lettered,
                    "Dead-lettered undecodable messages"
                );
            }
            Err(e) => {
                error!(queue = %self.keys.name, ids = ?ids, error = %e, "Failed to dead-letter undecodable messages");
            }
        }
    }

    pub async fn pop_one(&self) -> Result<Option<Message<T>>, QueueError> {
        Ok(self.pop(1).await?.into_iter().next())
    }

    /// Pops one specific id if it is waiting in the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Codec` when the payload cannot be decoded; the
    /// message has been dead-lettered by then.
    pub async fn pop_id(&self, id: &str) -> Result<Option<Message<T>>, QueueError> {
        let deadline = deadline_after(self.config.visibility_timeout);
        let Some(payload) = self.store.pop_id(&self.keys, id, deadline).await? else {
            return Ok(None);
        };
        self.metrics
            .record_messages(&self.keys.name, MessageOutcome::Popped, 1);

        match self.codec.decode(&payload) {
            Ok(payload) => Ok(Some(Message {
                id: id.to_string(),
                payload,
            })),
            Err(e) => {
                self.dead_letter_undecodable(&[id.to_string()]).await;
                Err(e.into())
            }
        }
    }

    /// Acknowledges in-flight messages, purging them.
    ///
    /// Returns the ids that were actually in flight; repeated or unknown ids
    /// are skipped.
    pub async fn ack(&self, ids: &[String]) -> Result<Vec<String>, QueueError> {
        let acked = self.store.ack(&self.keys, ids).await?;
        self.metrics
            .record_messages(&self.keys.name, MessageOutcome::Acked, acked.len());
        Ok(acked)
    }

    pub async fn ack_one(&self, id: &str) -> Result<bool, QueueError> {
        Ok(!self.ack(&[id.to_string()]).await?.is_empty())
    }

    /// Returns in-flight messages for redelivery, dead-lettering those whose
    /// retry budget is spent. Ids not in flight are skipped.
    pub async fn unack(&self, ids: &[String]) -> Result<UnackOutcome, QueueError> {
        let outcome = self
            .store
            .unack(&self.keys, ids, now_millis(), self.config.retry_budget)
            .await?;

        self.metrics
            .record_messages(&self.keys.name, MessageOutcome::Requeued, outcome.requeued.len());
        self.metrics.record_messages(
            &self.keys.name,
            MessageOutcome::DeadLettered,
            outcome.dead_lettered.len(),
        );
        if !outcome.dead_lettered.is_empty() {
            warn!(
                queue = %self.keys.name,
                ids = ?outcome.dead_lettered,
                "Messages exhausted their retry budget"
            );
        }
        Ok(outcome)
    }

    pub async fn unack_one(&self, id: &str) -> Result<UnackOutcome, QueueError> {
        self.unack(&[id.to_string()]).await
    }

    /// Redelivers or dead-letters messages whose visibility timeout passed.
    ///
    /// Returns the nearest remaining in-flight deadline (epoch millis).
    pub async fn sweep_timeouts(&self) -> Result<Option<i64>, QueueError> {
        let sweep = self
            .store
            .sweep_timeouts(
                &self.keys,
                now_millis(),
                self.config.sweep_batch,
                self.config.retry_budget,
            )
            .await?;
        listener::record_sweep(&self.metrics, &self.keys.name, &sweep);
        Ok(sweep.next)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let stats = self.store.queue_stats(&self.keys).await?;
        self.metrics.record_queue_depth(&self.keys.name, &stats);
        Ok(stats)
    }

    pub async fn retry_count(&self, id: &str) -> Result<u32, QueueError> {
        Ok(self.store.retry_count(&self.keys, id).await?)
    }

    /// Oldest dead letters first, at most `limit`.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.store.dead_letters(&self.keys, limit).await?)
    }

    /// Drops ids from the dead-letter set.
    pub async fn purge_dead_letters(&self, ids: &[String]) -> Result<usize, QueueError> {
        Ok(self.store.purge_dead_letters(&self.keys, ids).await?)
    }

    /// Subscribes to the queue's channel and keeps its timeouts swept.
    ///
    /// Only one listener per queue runs per registry: while a listener for
    /// this queue is active, further calls share it and `events` is dropped.
    /// The listener stops when the last guard is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self, events: impl QueueEvents) -> ListenerGuard {
        let handler = listener::QueueListener::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            self.config.clone(),
            Arc::new(events),
        );
        let usage = self
            .registry
            .register(&self.keys.queue, vec![Driver::new(handler)]);
        if usage > 1 {
            info!(
                queue = %self.keys.name,
                usage = usage,
                "Joined the running listener; its callbacks stay in place"
            );
        } else {
            debug!(queue = %self.keys.name, "Listening");
        }

        ListenerGuard::new(Arc::clone(&self.registry), self.keys.queue.clone())
    }
}

impl<T, C> std::fmt::Debug for AckQueue<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckQueue")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish()
    }
}
