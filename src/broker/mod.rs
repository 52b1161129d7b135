//! Message broker (C6): per-topic priority queues with acknowledgement,
//! filtered subscriptions, and optional persistence (spec.md §4.6).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SpiralError};
use crate::priority::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Processing,
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: MessageStatus,
    pub enqueue_time: chrono::DateTime<chrono::Utc>,
    pub publisher_id: Option<String>,
    pub subscriber_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct HeapEntry {
    priority: Priority,
    sequence: u64,
    message: Message,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for HeapEntry {}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type SubscriptionCallback = Arc<dyn Fn(&Message) + Send + Sync>;
type SubscriptionFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

struct Subscription {
    handle: u64,
    topic: String,
    subscriber_id: String,
    callback: SubscriptionCallback,
    filter: Option<SubscriptionFilter>,
}

impl Subscription {
    fn matches(&self, message: &Message) -> bool {
        if self.topic != message.topic && self.topic != "*" {
            return false;
        }
        match &self.filter {
            Some(f) => f(message),
            None => true,
        }
    }
}

/// Broker configuration, including an optional persistence directory
/// (spec.md §6: one file per unacknowledged message, `<message-id>.msg`).
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub persistence_dir: Option<PathBuf>,
}

/// Topic-based priority pub/sub broker.
pub struct MessageBroker {
    topics: Mutex<HashMap<String, BinaryHeap<HeapEntry>>>,
    pending_ack: Mutex<HashMap<String, Message>>,
    subscriptions: Mutex<Vec<Subscription>>,
    sequence: AtomicU64,
    subscription_handle: AtomicU64,
    persistence_dir: Option<PathBuf>,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            pending_ack: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            subscription_handle: AtomicU64::new(0),
            persistence_dir: config.persistence_dir,
        }
    }

    /// Replays any messages left on disk from an unclean shutdown back into
    /// their topic queues. Corrupt files are skipped with a log entry
    /// (spec.md §4.6, §6).
    pub async fn recover(&self) -> Result<usize> {
        let Some(dir) = &self.persistence_dir else {
            return Ok(0);
        };
        let mut recovered = 0;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("msg") {
                continue;
            }
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<Message>(&contents) {
                Ok(message) => {
                    self.enqueue(message).await;
                    recovered += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt persisted message"),
            }
        }
        Ok(recovered)
    }

    async fn enqueue(&self, message: Message) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let mut topics = self.topics.lock().await;
        topics.entry(message.topic.clone()).or_default().push(HeapEntry {
            priority: message.priority,
            sequence,
            message,
        });
    }

    fn persist_path(&self, message_id: &str) -> Option<PathBuf> {
        self.persistence_dir
            .as_ref()
            .map(|dir| dir.join(format!("{message_id}.msg")))
    }

    async fn persist(&self, message: &Message) {
        let Some(path) = self.persist_path(&message.message_id) else {
            return;
        };
        match serde_json::to_string_pretty(message) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json).await {
                    warn!(error = %e, "failed to persist message; continuing");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize message for persistence"),
        }
    }

    async fn remove_persisted(&self, message_id: &str) {
        if let Some(path) = self.persist_path(message_id) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        priority: Priority,
        publisher_id: Option<String>,
        metadata: HashMap<String, String>,
    ) -> String {
        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            priority,
            status: MessageStatus::Pending,
            enqueue_time: chrono::Utc::now(),
            publisher_id,
            subscriber_id: None,
            retry_count: 0,
            max_retries: crate::constants::DEFAULT_MAX_MESSAGE_RETRIES,
            metadata,
        };
        self.persist(&message).await;
        let message_id = message.message_id.clone();
        self.enqueue(message).await;
        message_id
    }

    /// Subscribes to `topic` (or `"*"` for every topic). Returns a handle
    /// for [`Self::unsubscribe`].
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber_id: &str,
        callback: impl Fn(&Message) + Send + Sync + 'static,
        filter: Option<Arc<dyn Fn(&Message) -> bool + Send + Sync>>,
    ) -> u64 {
        let handle = self.subscription_handle.fetch_add(1, AtomicOrdering::SeqCst);
        let mut subs = self.subscriptions.lock().await;
        subs.push(Subscription {
            handle,
            topic: topic.to_string(),
            subscriber_id: subscriber_id.to_string(),
            callback: Arc::new(callback),
            filter,
        });
        handle
    }

    pub async fn unsubscribe(&self, handle: u64) -> bool {
        let mut subs = self.subscriptions.lock().await;
        let before = subs.len();
        subs.retain(|s| s.handle != handle);
        subs.len() != before
    }

    /// Dequeues the highest-priority message for `topic`, waiting up to
    /// `timeout` for one to arrive. The message is delivered to every
    /// matching subscription *before* it's returned to the caller
    /// (spec.md §9 Open Question 2). `cancel`, if given, aborts the wait
    /// with [`SpiralError::Cancelled`] before any message is dequeued or
    /// delivered (spec.md §5: cancellation leaves no side effect).
    pub async fn receive(
        &self,
        topic: &str,
        subscriber_id: &str,
        timeout: Option<Duration>,
        cancel: Option<&Notify>,
    ) -> Result<Message> {
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            if let Some(mut message) = self.try_dequeue(topic).await {
                message.status = MessageStatus::Processing;
                message.subscriber_id = Some(subscriber_id.to_string());

                {
                    let subs = self.subscriptions.lock().await;
                    for sub in subs.iter() {
                        if sub.matches(&message) {
                            (sub.callback)(&message);
                        }
                    }
                }

                self.pending_ack
                    .lock()
                    .await
                    .insert(message.message_id.clone(), message.clone());
                self.persist(&message).await;
                return Ok(message);
            }

            if timeout == Some(Duration::ZERO) {
                return Err(SpiralError::timeout(format!(
                    "receive non-blocking found nothing on topic '{topic}'"
                )));
            }
            if matches!(deadline, Some(dl) if tokio::time::Instant::now() >= dl) {
                return Err(SpiralError::timeout(format!(
                    "receive timed out on topic '{topic}'"
                )));
            }

            let cancelled = async {
                match cancel {
                    Some(c) => c.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(
                    crate::constants::BROKER_RECEIVE_POLL_INTERVAL_MS,
                )) => {}
                _ = cancelled => return Err(SpiralError::Cancelled),
            }
        }
    }

    async fn try_dequeue(&self, topic: &str) -> Option<Message> {
        let mut topics = self.topics.lock().await;
        if topic == "*" {
            let mut best_topic: Option<String> = None;
            let mut best: Option<&HeapEntry> = None;
            for (name, heap) in topics.iter() {
                if let Some(entry) = heap.peek() {
                    let better = match best {
                        None => true,
                        Some(current) => entry.cmp(current) == Ordering::Greater,
                    };
                    if better {
                        best = Some(entry);
                        best_topic = Some(name.clone());
                    }
                }
            }
            let name = best_topic?;
            topics.get_mut(&name).and_then(|h| h.pop()).map(|e| e.message)
        } else {
            topics.get_mut(topic).and_then(|h| h.pop()).map(|e| e.message)
        }
    }

    pub async fn acknowledge(&self, message_id: &str) -> bool {
        let mut pending = self.pending_ack.lock().await;
        if pending.remove(message_id).is_none() {
            return false;
        }
        drop(pending);
        self.remove_persisted(message_id).await;
        true
    }

    pub async fn queue_size(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.lock().await.keys().cloned().collect()
    }

    pub async fn clear_topic(&self, topic: &str) {
        self.topics.lock().await.remove(topic);
    }

    #[cfg(test)]
    async fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn payload(level: &str) -> serde_json::Value {
        serde_json::json!({ "level": level })
    }

    #[tokio::test]
    async fn priority_then_fifo_delivery() {
        let broker = MessageBroker::new(BrokerConfig::default());
        broker
            .publish("t", payload("low"), Priority::Low, None, HashMap::new())
            .await;
        broker
            .publish("t", payload("critical"), Priority::Critical, None, HashMap::new())
            .await;
        broker
            .publish("t", payload("normal"), Priority::Normal, None, HashMap::new())
            .await;
        broker
            .publish("t", payload("high"), Priority::High, None, HashMap::new())
            .await;

        let mut levels = Vec::new();
        for _ in 0..4 {
            let message = broker.receive("t", "sub", Some(Duration::ZERO), None).await.unwrap();
            levels.push(message.payload["level"].as_str().unwrap().to_string());
        }
        assert_eq!(levels, vec!["critical", "high", "normal", "low"]);
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let id = broker
            .publish("t", payload("x"), Priority::Normal, None, HashMap::new())
            .await;
        let message = broker.receive("t", "sub", Some(Duration::ZERO), None).await.unwrap();
        assert_eq!(message.message_id, id);

        assert!(broker.acknowledge(&id).await);
        assert!(!broker.acknowledge(&id).await);
        assert!(!broker.acknowledge("unknown").await);
    }

    #[tokio::test]
    async fn wildcard_subscriber_sees_every_topic() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        broker
            .subscribe("*", "sub", move |_msg| {
                c2.fetch_add(1, AtomicOrdering::SeqCst);
            }, None)
            .await;

        broker
            .publish("a", payload("x"), Priority::Normal, None, HashMap::new())
            .await;
        broker
            .publish("b", payload("y"), Priority::Normal, None, HashMap::new())
            .await;

        let _ = broker.receive("a", "sub", Some(Duration::ZERO), None).await;
        let _ = broker.receive("b", "sub", Some(Duration::ZERO), None).await;

        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filter_suppresses_non_matching_callback() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        broker
            .subscribe(
                "t",
                "sub",
                move |_msg| {
                    c2.fetch_add(1, AtomicOrdering::SeqCst);
                },
                Some(Arc::new(|m: &Message| m.payload["level"] == "high")),
            )
            .await;

        broker
            .publish("t", payload("low"), Priority::Low, None, HashMap::new())
            .await;
        broker
            .publish("t", payload("high"), Priority::High, None, HashMap::new())
            .await;

        let _ = broker.receive("t", "sub", Some(Duration::ZERO), None).await;
        let _ = broker.receive("t", "sub", Some(Duration::ZERO), None).await;

        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscription() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let handle = broker.subscribe("t", "sub", |_| {}, None).await;
        assert_eq!(broker.subscriber_count().await, 1);
        assert!(broker.unsubscribe(handle).await);
        assert_eq!(broker.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn persistence_round_trips_through_recover() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            persistence_dir: Some(dir.path().to_path_buf()),
        };
        let broker = MessageBroker::new(config.clone());
        broker
            .publish("t", payload("x"), Priority::Normal, None, HashMap::new())
            .await;

        // Message file should exist until acknowledged.
        let mut found = false;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("msg") {
                found = true;
            }
        }
        assert!(found);

        let broker2 = MessageBroker::new(config);
        let recovered = broker2.recover().await.unwrap();
        assert_eq!(recovered, 1);
        let message = broker2.receive("t", "sub", Some(Duration::ZERO), None).await.unwrap();
        assert_eq!(message.payload["level"], "x");
    }

    #[tokio::test]
    async fn receive_cancel_returns_cancelled_without_consuming_message() {
        let broker = Arc::new(MessageBroker::new(BrokerConfig::default()));
        let cancel = Arc::new(Notify::new());
        let b2 = broker.clone();
        let c2 = cancel.clone();
        let handle = tokio::spawn(async move { b2.receive("t", "sub", None, Some(&c2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.notify_one();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SpiralError::Cancelled)));

        broker
            .publish("t", payload("x"), Priority::Normal, None, HashMap::new())
            .await;
        let message = broker.receive("t", "sub", Some(Duration::ZERO), None).await.unwrap();
        assert_eq!(message.payload["level"], "x");
    }
}
