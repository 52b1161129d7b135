//! Priority task queue (C8).
//!
//! A process-wide, thread-safe min-heap keyed on `(priority, sequence)`.
//! `sequence` is a monotonic counter assigned on enqueue, which guarantees
//! strict FIFO among equal-priority tasks without relying on clock
//! resolution (spec.md §4.1).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::error::{Result, SpiralError};
use crate::priority::Priority;

/// A unit of work enqueued with a priority. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub priority: Priority,
    /// Opaque payload — the kernel never inspects its contents. Decoded by
    /// whatever agent contract the caller and its agents agree on.
    pub payload: Vec<u8>,
    pub enqueue_time: chrono::DateTime<chrono::Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, priority: Priority, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            priority,
            payload,
            enqueue_time: chrono::Utc::now(),
        }
    }
}

/// Heap entry ordering: lower priority value and lower sequence dispatch
/// first. `BinaryHeap` is a max-heap, so we invert the comparison.
#[derive(Debug, Clone)]
struct HeapEntry {
    priority: Priority,
    sequence: u64,
    task: Task,
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

/// Thread-safe priority queue of [`Task`]s.
pub struct PriorityTaskQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    sequence: AtomicU64,
    notify: Notify,
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub async fn enqueue(&self, task: Task) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let mut heap = self.heap.lock().await;
        heap.push(HeapEntry {
            priority: task.priority,
            sequence,
            task,
        });
        drop(heap);
        self.notify.notify_one();
    }

    /// Non-blocking dequeue. Returns `None` immediately if the queue is empty.
    pub async fn try_dequeue(&self) -> Option<Task> {
        let mut heap = self.heap.lock().await;
        heap.pop().map(|entry| entry.task)
    }

    /// Blocking dequeue with an optional timeout and cancellation signal.
    /// `timeout = None` waits forever; `Some(Duration::ZERO)` behaves like
    /// [`Self::try_dequeue`].
    pub async fn dequeue(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&Notify>,
    ) -> Result<Task> {
        if let Some(d) = timeout {
            if d.is_zero() {
                return self.try_dequeue().await.ok_or_else(|| {
                    SpiralError::timeout("queue dequeue: no task available (non-blocking)")
                });
            }
        }

        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);

        loop {
            if let Some(task) = self.try_dequeue().await {
                return Ok(task);
            }

            let wait = async { self.notify.notified().await };
            let cancelled = async {
                match cancel {
                    Some(c) => c.notified().await,
                    None => std::future::pending::<()>().await,
                }
            };

            match deadline {
                Some(dl) => {
                    tokio::select! {
                        _ = wait => {}
                        _ = cancelled => return Err(SpiralError::Cancelled),
                        _ = tokio::time::sleep_until(dl) => {
                            return self.try_dequeue().await.ok_or_else(|| {
                                SpiralError::timeout("queue dequeue timed out")
                            });
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = wait => {}
                        _ = cancelled => return Err(SpiralError::Cancelled),
                    }
                }
            }
        }
    }

    pub async fn peek(&self) -> Option<Task> {
        let heap = self.heap.lock().await;
        heap.peek().map(|entry| entry.task.clone())
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub type SharedTaskQueue = Arc<PriorityTaskQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_order_is_priority_then_fifo() {
        let queue = PriorityTaskQueue::new();
        queue
            .enqueue(Task::new("normal", Priority::Normal, vec![]))
            .await;
        queue
            .enqueue(Task::new("high", Priority::High, vec![]))
            .await;
        queue
            .enqueue(Task::new("critical", Priority::Critical, vec![]))
            .await;
        queue
            .enqueue(Task::new("low", Priority::Low, vec![]))
            .await;

        let mut order = Vec::new();
        while let Some(t) = queue.try_dequeue().await {
            order.push(t.id);
        }
        assert_eq!(order, vec!["critical", "high", "normal", "low"]);
    }

    #[tokio::test]
    async fn fifo_within_equal_priority() {
        let queue = PriorityTaskQueue::new();
        queue.enqueue(Task::new("a", Priority::Normal, vec![])).await;
        queue.enqueue(Task::new("b", Priority::Normal, vec![])).await;
        queue.enqueue(Task::new("c", Priority::Normal, vec![])).await;

        assert_eq!(queue.try_dequeue().await.unwrap().id, "a");
        assert_eq!(queue.try_dequeue().await.unwrap().id, "b");
        assert_eq!(queue.try_dequeue().await.unwrap().id, "c");
    }

    #[tokio::test]
    async fn try_dequeue_on_empty_returns_none() {
        let queue = PriorityTaskQueue::new();
        assert!(queue.try_dequeue().await.is_none());
    }

    #[tokio::test]
    async fn dequeue_non_blocking_times_out_on_empty() {
        let queue = PriorityTaskQueue::new();
        let err = queue.dequeue(Some(Duration::ZERO), None).await.unwrap_err();
        assert!(matches!(err, SpiralError::Timeout { .. }));
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = Arc::new(PriorityTaskQueue::new());
        let q2 = queue.clone();
        let handle = tokio::spawn(async move { q2.dequeue(None, None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(Task::new("x", Priority::Normal, vec![])).await;

        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.id, "x");
    }

    #[tokio::test]
    async fn dequeue_cancel_returns_cancelled() {
        let queue = Arc::new(PriorityTaskQueue::new());
        let cancel = Arc::new(Notify::new());
        let q2 = queue.clone();
        let c2 = cancel.clone();
        let handle = tokio::spawn(async move { q2.dequeue(None, Some(&c2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.notify_one();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SpiralError::Cancelled)));
    }
}
