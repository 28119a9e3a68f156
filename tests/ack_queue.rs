//! Acknowledged queue behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ackqueue::error::QueueError;
use ackqueue::queue::{Message, QueueEvents, WorkerPool, WorkerPoolConfig};
use ackqueue::store::MemoryStore;
use ackqueue::{AckQueue, QueueConfig, RawCodec, TaskRegistry};
use async_trait::async_trait;
use tokio::sync::mpsc;

fn queue(store: &MemoryStore, name: &str, config: QueueConfig) -> AckQueue<String, RawCodec> {
    AckQueue::with_codec(Arc::new(store.clone()), name, RawCodec)
        .with_config(config)
        .with_registry(Arc::new(TaskRegistry::new()))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_push_pop_ack_round_trip() {
    let store = MemoryStore::new();
    let q = queue(&store, "round-trip", QueueConfig::default());

    let ids = q.push(&strings(&["a", "b", "c"])).await.unwrap();
    assert_eq!(ids.len(), 3);

    let messages = q.pop(10).await.unwrap();
    let payloads: Vec<&str> = messages.iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, ["a", "b", "c"]);
    assert_eq!(q.stats().await.unwrap().in_flight, 3);

    let acked = q.ack(&ids).await.unwrap();
    assert_eq!(acked, ids);

    let stats = q.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.payloads, 0);
}

#[tokio::test]
async fn test_double_ack_is_noop() {
    let store = MemoryStore::new();
    let q = queue(&store, "double-ack", QueueConfig::default());

    let id = q.push_one(&"x".to_string()).await.unwrap();
    q.pop_one().await.unwrap().expect("message should be delivered");

    assert!(q.ack_one(&id).await.unwrap());
    assert!(!q.ack_one(&id).await.unwrap());
    assert!(q.pop_one().await.unwrap().is_none());
}

#[tokio::test]
async fn test_ack_of_queued_message_does_nothing() {
    let store = MemoryStore::new();
    let q = queue(&store, "ack-queued", QueueConfig::default());

    let id = q.push_one(&"x".to_string()).await.unwrap();
    assert!(!q.ack_one(&id).await.unwrap());

    let message = q.pop_one().await.unwrap().expect("message should still be queued");
    assert_eq!(message.id, id);
}

#[tokio::test]
async fn test_retry_budget_dead_letters_after_limit() {
    let store = MemoryStore::new();
    let q = queue(
        &store,
        "budget-two",
        QueueConfig::default().with_retry_budget(2),
    );

    let id = q.push_one(&"job".to_string()).await.unwrap();
    for attempt in 1..=2 {
        q.pop_one().await.unwrap().expect("message should be redelivered");
        let outcome = q.unack_one(&id).await.unwrap();
        assert_eq!(outcome.requeued, vec![id.clone()]);
        assert_eq!(q.retry_count(&id).await.unwrap(), attempt);
    }

    q.pop_one().await.unwrap().expect("third delivery");
    let outcome = q.unack_one(&id).await.unwrap();
    assert!(outcome.requeued.is_empty());
    assert_eq!(outcome.dead_lettered, vec![id.clone()]);

    let dead = q.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert!(q.pop_one().await.unwrap().is_none());
    assert_eq!(q.stats().await.unwrap().payloads, 0);
}

#[tokio::test]
async fn test_zero_budget_dead_letters_first_failure() {
    let store = MemoryStore::new();
    let q = queue(
        &store,
        "budget-zero",
        QueueConfig::default().with_retry_budget(0),
    );

    let id = q.push_one(&"job".to_string()).await.unwrap();
    q.pop_one().await.unwrap().expect("first delivery");
    let outcome = q.unack_one(&id).await.unwrap();

    assert_eq!(outcome.dead_lettered, vec![id]);
    assert_eq!(q.stats().await.unwrap().dead_lettered, 1);
}

#[tokio::test]
async fn test_negative_budget_retries_forever() {
    let store = MemoryStore::new();
    let q = queue(
        &store,
        "budget-forever",
        QueueConfig::default().with_retry_budget(-1),
    );

    let id = q.push_one(&"job".to_string()).await.unwrap();
    for _ in 0..100 {
        let message = q.pop_one().await.unwrap().expect("always redelivered");
        assert_eq!(message.id, id);
        let outcome = q.unack_one(&id).await.unwrap();
        assert!(outcome.dead_lettered.is_empty());
    }

    assert_eq!(q.stats().await.unwrap().dead_lettered, 0);
    assert_eq!(q.retry_count(&id).await.unwrap(), 100);
}

#[tokio::test]
async fn test_unack_ignores_ids_not_in_flight() {
    let store = MemoryStore::new();
    let q = queue(&store, "unack-unknown", QueueConfig::default());

    let id = q.push_one(&"x".to_string()).await.unwrap();
    let outcome = q.unack(&[id.clone(), "missing".to_string()]).await.unwrap();

    assert!(outcome.requeued.is_empty());
    assert!(outcome.dead_lettered.is_empty());
    assert_eq!(q.stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_expired_message_is_redelivered_after_sweep() {
    let store = MemoryStore::new();
    let q = queue(
        &store,
        "visibility",
        QueueConfig::default().with_visibility_timeout(Duration::from_secs(1)),
    );

    let id = q.push_one(&"slow".to_string()).await.unwrap();
    q.pop_one().await.unwrap().expect("first delivery");
    assert!(q.sweep_timeouts().await.unwrap().is_some());
    assert!(q.pop_one().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(q.sweep_timeouts().await.unwrap(), None);
    let message = q.pop_one().await.unwrap().expect("redelivered after timeout");
    assert_eq!(message.id, id);
    assert_eq!(q.retry_count(&id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_undecodable_message_is_dead_lettered_on_pop() {
    let store = MemoryStore::new();
    let registry = Arc::new(TaskRegistry::new());
    let writer: AckQueue<serde_json::Value> = AckQueue::new(Arc::new(store.clone()), "mixed")
        .with_registry(Arc::clone(&registry));
    let reader: AckQueue<u32> =
        AckQueue::new(Arc::new(store.clone()), "mixed").with_registry(registry);

    let ids = writer
        .push(&[serde_json::json!(7), serde_json::json!("not-a-number")])
        .await
        .unwrap();

    let messages = reader.pop(2).await.unwrap();
    assert_eq!(
        messages,
        vec![Message {
            id: ids[0].clone(),
            payload: 7
        }]
    );

    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.dead_lettered, 1);
    let dead = reader.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, ids[1]);

    // Nothing is left behind to poison later pops.
    assert!(reader.pop(2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pop_id_dead_letters_undecodable_payload() {
    let store = MemoryStore::new();
    let registry = Arc::new(TaskRegistry::new());
    let writer: AckQueue<serde_json::Value> = AckQueue::new(Arc::new(store.clone()), "pop-id-bad")
        .with_registry(Arc::clone(&registry));
    let reader: AckQueue<u32> =
        AckQueue::new(Arc::new(store.clone()), "pop-id-bad").with_registry(registry);

    let id = writer.push_one(&serde_json::json!({"not": "a number"})).await.unwrap();

    let err = reader.pop_id(&id).await.unwrap_err();
    assert!(matches!(err, QueueError::Codec(_)));

    let stats = reader.stats().await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn test_message_is_never_queued_and_in_flight() {
    let store = MemoryStore::new();
    let q = queue(&store, "exclusive", QueueConfig::default());

    let ids = q.push(&strings(&["1", "2", "3", "4"])).await.unwrap();
    let popped: HashSet<String> = q.pop(2).await.unwrap().into_iter().map(|m| m.id).collect();

    q.unack(&[ids[0].clone()]).await.unwrap();
    let rest: HashSet<String> = q.pop(10).await.unwrap().into_iter().map(|m| m.id).collect();

    // Every id was delivered, and only the unacked one was delivered twice.
    let all: HashSet<String> = ids.iter().cloned().collect();
    assert_eq!(popped.union(&rest).cloned().collect::<HashSet<_>>(), all);
    let twice: Vec<&String> = popped.intersection(&rest).collect();
    assert_eq!(twice, vec![&ids[0]]);

    let stats = q.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 4);
}

#[tokio::test]
async fn test_pop_id_takes_specific_message() {
    let store = MemoryStore::new();
    let q = queue(&store, "pop-id", QueueConfig::default());

    let ids = q.push(&strings(&["first", "second"])).await.unwrap();
    let message = q.pop_id(&ids[1]).await.unwrap().expect("queued id");
    assert_eq!(message.payload, "second");

    assert!(q.pop_id(&ids[1]).await.unwrap().is_none());
    assert!(q.pop_id("unknown").await.unwrap().is_none());

    let next = q.pop_one().await.unwrap().expect("first is still queued");
    assert_eq!(next.id, ids[0]);
}

#[tokio::test]
async fn test_push_with_caller_ids() {
    let store = MemoryStore::new();
    let q = queue(&store, "caller-ids", QueueConfig::default());

    let ids = q
        .push_with_ids(&[("order-1".to_string(), "paid".to_string())])
        .await
        .unwrap();
    assert_eq!(ids, vec!["order-1".to_string()]);

    let message = q.pop_one().await.unwrap().expect("delivered");
    assert_eq!(
        message,
        Message {
            id: "order-1".to_string(),
            payload: "paid".to_string()
        }
    );
    assert!(q.push_with_ids(&[(String::new(), "x".to_string())]).await.is_err());
}

struct Forward(mpsc::UnboundedSender<(String, String)>);

#[async_trait]
impl QueueEvents for Forward {
    async fn on_message(&self, _queue: &str, id: &str) {
        let _ = self.0.send(("message".to_string(), id.to_string()));
    }

    async fn on_error(&self, _queue: &str, id: &str) {
        let _ = self.0.send(("error".to_string(), id.to_string()));
    }
}

#[tokio::test]
async fn test_listener_reports_messages_and_dead_letters() {
    let store = MemoryStore::new();
    let q = queue(
        &store,
        "listener",
        QueueConfig::default().with_retry_budget(0),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let guard = q.listen(Forward(tx));

    let channel = q.keys().channel.clone();
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.subscriber_count(&channel) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener should subscribe");

    let id = q.push_one(&"x".to_string()).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message event")
        .expect("channel open");
    assert_eq!(event, ("message".to_string(), id.clone()));

    q.pop_one().await.unwrap();
    q.unack_one(&id).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("error event")
        .expect("channel open");
    assert_eq!(event, ("error".to_string(), id));

    guard.close();
}

#[tokio::test]
async fn test_listener_redelivers_expired_messages_without_manual_sweep() {
    let store = MemoryStore::new();
    let q = queue(
        &store,
        "listener-sweep",
        QueueConfig::default().with_visibility_timeout(Duration::from_secs(1)),
    );

    let id = q.push_one(&"slow".to_string()).await.unwrap();
    q.pop_one().await.unwrap().expect("first delivery");

    let (tx, _rx) = mpsc::unbounded_channel();
    let guard = q.listen(Forward(tx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while q.stats().await.unwrap().pending == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener should requeue the expired message");

    let message = q.pop_one().await.unwrap().expect("redelivered");
    assert_eq!(message.id, id);
    assert_eq!(q.retry_count(&id).await.unwrap(), 1);

    guard.close();
}

#[tokio::test]
async fn test_worker_pool_polls_when_listener_already_running() {
    let store = MemoryStore::new();
    let q = Arc::new(queue(&store, "pool-shared", QueueConfig::default()));

    let (tx, _rx) = mpsc::unbounded_channel();
    let guard = q.listen(Forward(tx));

    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let handler = move |_message: Message<String>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    };

    let config = WorkerPoolConfig::default()
        .with_num_workers(1)
        .with_poll_interval(Duration::from_millis(20));
    let mut pool = WorkerPool::new(config, Arc::clone(&q), handler);
    pool.start().await.unwrap();

    q.push(&strings(&["a", "b"])).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while processed.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pool should still drain the queue");

    pool.shutdown().await.unwrap();
    guard.close();
    assert_eq!(q.stats().await.unwrap().live(), 0);
}

#[tokio::test]
async fn test_worker_pool_acks_successes_and_retries_failures() {
    let store = MemoryStore::new();
    let q = Arc::new(queue(
        &store,
        "pool",
        QueueConfig::default().with_retry_budget(1),
    ));
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    let handler = move |message: Message<String>| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if message.payload == "bad" {
                anyhow::bail!("cannot process {}", message.id);
            }
            Ok(())
        }
    };

    let config = WorkerPoolConfig::default()
        .with_num_workers(2)
        .with_poll_interval(Duration::from_millis(20));
    let mut pool = WorkerPool::new(config, Arc::clone(&q), handler);
    pool.start().await.unwrap();

    q.push(&strings(&["good", "bad", "good"])).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = q.stats().await.unwrap();
            if stats.live() == 0 && stats.dead_lettered == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pool should settle every message");

    pool.shutdown().await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.messages_acked, 2);
    assert_eq!(stats.messages_failed, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(!pool.is_running());
}
