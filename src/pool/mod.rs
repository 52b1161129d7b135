//! Worker pool (C9): a fixed set of agent slots dispatching from the
//! priority task queue, with health monitoring and load-driven auto-scaling
//! (spec.md §4.2).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentState};
use crate::balance::{self, BalancingStrategy, Candidate};
use crate::error::Result;
use crate::priority::Priority;
use crate::queue::{SharedTaskQueue, Task};
use crate::resource;

/// Dispatch algorithm offered to the load balancer for picking among
/// eligible idle workers (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    LeastConnections,
    RoundRobin,
    /// Filters to workers whose `priority_class` is at least as high
    /// (numerically ≤) as the task's priority, then picks the least-loaded
    /// of those (`agent_pool_enhanced.py`'s `PriorityLoadBalancer`).
    PriorityAware,
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        DispatchStrategy::LeastConnections
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub max_concurrent_tasks: usize,
    pub dispatch_strategy: DispatchStrategy,
    pub auto_scale_interval: Duration,
    pub health_check_interval: Duration,
    pub max_consecutive_health_failures: u32,
    pub scale_up_cpu_watermark: f64,
    pub scale_down_load_threshold: f64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_size: crate::constants::DEFAULT_MIN_POOL_SIZE,
            max_size: crate::constants::DEFAULT_MAX_POOL_SIZE,
            max_concurrent_tasks: crate::constants::DEFAULT_MAX_CONCURRENT_TASKS,
            dispatch_strategy: DispatchStrategy::default(),
            auto_scale_interval: Duration::from_millis(
                crate::constants::DEFAULT_AUTO_SCALE_INTERVAL_MS,
            ),
            health_check_interval: Duration::from_secs(10),
            max_consecutive_health_failures: crate::constants::DEFAULT_MAX_CONSECUTIVE_HEALTH_FAILURES,
            scale_up_cpu_watermark: crate::constants::DEFAULT_SCALE_UP_CPU_WATERMARK,
            scale_down_load_threshold: crate::constants::DEFAULT_SCALE_DOWN_LOAD_THRESHOLD,
        }
    }
}

struct Worker {
    agent: Arc<dyn Agent>,
    state: AgentState,
    priority_class: Priority,
    /// The tasks currently dispatched to this worker. Its length is this
    /// worker's current-load count (spec.md §3).
    active_tasks: HashSet<String>,
    consecutive_failures: u32,
    tasks_completed: u64,
    tasks_failed: u64,
}

/// A worker snapshot offered to the load balancer — read out from under the
/// per-worker lock so [`balance::select_index`] can compare plain values
/// without holding every worker's lock at once.
struct WorkerCandidate {
    id: String,
    load: u64,
}

impl Candidate for WorkerCandidate {
    fn id(&self) -> &str {
        &self.id
    }
    fn active_connections(&self) -> u64 {
        self.load
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub worker_count: usize,
    pub idle_count: usize,
    pub busy_count: usize,
    pub failed_count: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// A minimal agent that echoes its task payload back, used to fill
/// auto-created slots (pool bootstrap and scale-up) when the caller hasn't
/// supplied its own agent factory.
struct PassthroughAgent {
    id: String,
}

#[async_trait]
impl Agent for PassthroughAgent {
    fn id(&self) -> &str {
        &self.id
    }
    async fn execute(&self, task: &Task) -> Result<Vec<u8>> {
        Ok(task.payload.clone())
    }
}

type AgentFactory = Box<dyn Fn(&str) -> Arc<dyn Agent> + Send + Sync>;

fn default_agent_factory() -> AgentFactory {
    Box::new(|id: &str| Arc::new(PassthroughAgent { id: id.to_string() }) as Arc<dyn Agent>)
}

/// Coordinates a set of [`Agent`]s pulling from a shared priority queue.
/// `Start` (via [`WorkerPool::run`]) bootstraps `min_size` agents using the
/// pool's own agent factory; callers may [`WorkerPool::add_worker`] more up
/// to `max_size`, and the auto-scale loop grows/shrinks within
/// `[min_size, max_size]` on its own (spec.md §4.2).
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: SharedTaskQueue,
    workers: RwLock<HashMap<String, Mutex<Worker>>>,
    /// Insertion order, used to break load-balancing and scale-down ties
    /// deterministically rather than on `HashMap` iteration order.
    order: Mutex<Vec<String>>,
    round_robin_cursor: Mutex<usize>,
    in_flight: AtomicUsize,
    shutdown: Notify,
    agent_factory: AgentFactory,
    next_auto_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, queue: SharedTaskQueue) -> Self {
        Self::with_agent_factory(config, queue, default_agent_factory())
    }

    /// Like [`Self::new`], but auto-created agents (bootstrap and
    /// scale-up) are built by `agent_factory` instead of the default
    /// passthrough agent.
    pub fn with_agent_factory(
        config: WorkerPoolConfig,
        queue: SharedTaskQueue,
        agent_factory: AgentFactory,
    ) -> Self {
        Self {
            config,
            queue,
            workers: RwLock::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            round_robin_cursor: Mutex::new(0),
            in_flight: AtomicUsize::new(0),
            shutdown: Notify::new(),
            agent_factory,
            next_auto_id: AtomicUsize::new(0),
        }
    }

    /// Adds `agent` as a worker. Returns `false` without adding it if the
    /// pool is already at `max_size` (spec.md §4.2 `AddAgent → ok|full`).
    pub async fn add_worker(&self, agent: Arc<dyn Agent>) -> bool {
        let id = agent.id().to_string();
        let mut workers = self.workers.write().await;
        if !workers.contains_key(&id) && workers.len() >= self.config.max_size {
            return false;
        }
        let priority_class = agent.priority_class();
        let is_new = workers
            .insert(
                id.clone(),
                Mutex::new(Worker {
                    agent,
                    state: AgentState::Idle,
                    priority_class,
                    active_tasks: HashSet::new(),
                    consecutive_failures: 0,
                    tasks_completed: 0,
                    tasks_failed: 0,
                }),
            )
            .is_none();
        drop(workers);
        if is_new {
            self.order.lock().await.push(id);
        }
        true
    }

    pub async fn remove_worker(&self, id: &str) -> bool {
        let removed = self.workers.write().await.remove(id).is_some();
        if removed {
            self.order.lock().await.retain(|o| o != id);
        }
        removed
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    async fn bootstrap_min_size(&self) {
        while self.worker_count().await < self.config.min_size {
            let idx = self.next_auto_id.fetch_add(1, AtomicOrdering::SeqCst);
            let agent = (self.agent_factory)(&format!("auto-{idx}"));
            if !self.add_worker(agent).await {
                break;
            }
        }
    }

    /// Bootstraps `min_size` workers, then runs the dispatch loop, health
    /// loop, and auto-scale loop concurrently until [`Self::shutdown`] is
    /// signalled.
    pub async fn run(self: Arc<Self>) {
        self.bootstrap_min_size().await;

        let dispatch = {
            let pool = self.clone();
            tokio::spawn(async move { pool.dispatch_loop().await })
        };
        let health = {
            let pool = self.clone();
            tokio::spawn(async move { pool.health_loop().await })
        };
        let scale = {
            let pool = self.clone();
            tokio::spawn(async move { pool.auto_scale_loop().await })
        };

        tokio::select! {
            _ = dispatch => {}
            _ = health => {}
            _ = scale => {}
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn dispatch_loop(&self) {
        info!("worker pool dispatch loop started");
        loop {
            if self.in_flight.load(AtomicOrdering::SeqCst) >= self.config.max_concurrent_tasks {
                tokio::time::sleep(Duration::from_millis(crate::constants::TASK_POLL_INTERVAL_MS))
                    .await;
                continue;
            }

            let task = tokio::select! {
                t = self.queue.try_dequeue() => t,
                _ = self.shutdown.notified() => return,
            };

            let Some(task) = task else {
                tokio::time::sleep(Duration::from_millis(crate::constants::TASK_POLL_INTERVAL_MS))
                    .await;
                continue;
            };

            let Some(worker_id) = self.pick_worker(&task).await else {
                // No capacity right now — put the task back and wait.
                self.queue.enqueue(task).await;
                tokio::time::sleep(Duration::from_millis(crate::constants::TASK_POLL_INTERVAL_MS))
                    .await;
                continue;
            };

            self.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
            self.dispatch_to(worker_id, task).await;
        }
    }

    /// Offers `task` to the load balancer: collects eligible idle workers
    /// (filtered by `priority_class` under [`DispatchStrategy::PriorityAware`]),
    /// picks one per `config.dispatch_strategy`, and marks it `Busy`.
    async fn pick_worker(&self, task: &Task) -> Option<String> {
        let order = self.order.lock().await.clone();
        let mut candidates = Vec::new();
        {
            let workers = self.workers.read().await;
            for id in &order {
                let Some(worker) = workers.get(id) else {
                    continue;
                };
                let guard = worker.lock().await;
                if guard.state != AgentState::Idle {
                    continue;
                }
                if self.config.dispatch_strategy == DispatchStrategy::PriorityAware
                    && guard.priority_class > task.priority
                {
                    continue;
                }
                candidates.push(WorkerCandidate {
                    id: id.clone(),
                    load: guard.active_tasks.len() as u64,
                });
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let strategy = match self.config.dispatch_strategy {
            DispatchStrategy::RoundRobin => BalancingStrategy::RoundRobin,
            DispatchStrategy::LeastConnections | DispatchStrategy::PriorityAware => {
                BalancingStrategy::LeastConnections
            }
        };
        let mut cursor = self.round_robin_cursor.lock().await;
        let index = balance::select_index(&candidates, strategy, None, &mut cursor)?;
        let chosen = candidates.into_iter().nth(index).map(|c| c.id)?;

        let workers = self.workers.read().await;
        if let Some(worker) = workers.get(&chosen) {
            let mut guard = worker.lock().await;
            guard.state = AgentState::Busy;
            guard.active_tasks.insert(task.id.clone());
        }
        Some(chosen)
    }

    async fn dispatch_to(&self, worker_id: String, task: Task) {
        let agent = {
            let workers = self.workers.read().await;
            let Some(worker) = workers.get(&worker_id) else {
                self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                return;
            };
            worker.lock().await.agent.clone()
        };

        let result = agent.execute(&task).await;

        let workers = self.workers.read().await;
        if let Some(worker) = workers.get(&worker_id) {
            let mut w = worker.lock().await;
            w.active_tasks.remove(&task.id);
            w.state = AgentState::Idle;
            match result {
                Ok(_) => {
                    w.tasks_completed += 1;
                    debug!(task = %task.id, worker = %worker_id, "task completed");
                }
                Err(e) => {
                    w.tasks_failed += 1;
                    warn!(task = %task.id, worker = %worker_id, error = %e, "task failed");
                }
            }
        }
        self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    async fn health_loop(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
                _ = self.shutdown.notified() => return,
            }

            let workers = self.workers.read().await;
            for (id, worker) in workers.iter() {
                let healthy = worker.lock().await.agent.health_check().await;
                let mut w = worker.lock().await;
                if healthy {
                    w.consecutive_failures = 0;
                    if w.state == AgentState::Failed {
                        w.state = AgentState::Idle;
                        info!(worker = %id, "worker recovered");
                    }
                } else {
                    w.consecutive_failures += 1;
                    if w.consecutive_failures >= self.config.max_consecutive_health_failures {
                        w.state = AgentState::Failed;
                        error!(worker = %id, "worker marked failed after consecutive health check failures");
                    }
                }
            }
        }
    }

    async fn auto_scale_loop(&self) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.auto_scale_interval) => {}
                _ = self.shutdown.notified() => return,
            }

            let sample = resource::sample().await;
            let queue_len = self.queue.len().await as f64;
            let worker_count = self.worker_count().await;

            // Load is the primary scaling signal; CPU only escalates an
            // already-loaded decision (spec.md §9 Open Question 3).
            let load = if worker_count == 0 {
                f64::INFINITY
            } else {
                queue_len / worker_count as f64
            };

            if worker_count < self.config.max_size
                && (load > 1.0 || sample.cpu_percent > self.config.scale_up_cpu_watermark)
            {
                let idx = self.next_auto_id.fetch_add(1, AtomicOrdering::SeqCst);
                let agent = (self.agent_factory)(&format!("auto-{idx}"));
                if self.add_worker(agent).await {
                    info!(load, cpu = sample.cpu_percent, "auto-scaled up");
                }
            } else if worker_count > self.config.min_size
                && load < self.config.scale_down_load_threshold
            {
                if let Some(victim) = self.scale_down_victim().await {
                    self.remove_worker(&victim).await;
                    info!(load, worker = %victim, "auto-scaled down");
                }
            }
        }
    }

    /// Among zero-load workers, picks the one with the lowest priority
    /// class (largest numeric value), ties broken by insertion order
    /// (`agent_pool_enhanced.py`'s `_scale_down`).
    async fn scale_down_victim(&self) -> Option<String> {
        let order = self.order.lock().await.clone();
        let workers = self.workers.read().await;
        let mut victim: Option<(String, Priority)> = None;
        for id in &order {
            let Some(worker) = workers.get(id) else {
                continue;
            };
            let guard = worker.lock().await;
            if !guard.active_tasks.is_empty() {
                continue;
            }
            let better = match &victim {
                None => true,
                Some((_, best_priority)) => guard.priority_class > *best_priority,
            };
            if better {
                victim = Some((id.clone(), guard.priority_class));
            }
        }
        victim.map(|(id, _)| id)
    }

    pub async fn stats(&self) -> PoolStats {
        let workers = self.workers.read().await;
        let mut stats = PoolStats {
            worker_count: workers.len(),
            ..Default::default()
        };
        for worker in workers.values() {
            let w = worker.lock().await;
            match w.state {
                AgentState::Idle => stats.idle_count += 1,
                AgentState::Busy => stats.busy_count += 1,
                AgentState::Failed => stats.failed_count += 1,
                _ => {}
            }
            stats.tasks_completed += w.tasks_completed;
            stats.tasks_failed += w.tasks_failed;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::priority::Priority;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct EchoAgent {
        id: String,
        calls: Arc<AtomicU32>,
        priority_class: Priority,
    }

    #[async_trait]
    impl Agent for EchoAgent {
        fn id(&self) -> &str {
            &self.id
        }
        async fn execute(&self, _task: &Task) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(vec![])
        }
        fn priority_class(&self) -> Priority {
            self.priority_class
        }
    }

    fn no_bootstrap_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_size: 0,
            ..WorkerPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn dispatches_task_to_idle_worker() {
        let queue: SharedTaskQueue = Arc::new(crate::queue::PriorityTaskQueue::new());
        let pool = Arc::new(WorkerPool::new(no_bootstrap_config(), queue.clone()));
        let calls = Arc::new(AtomicU32::new(0));
        pool.add_worker(Arc::new(EchoAgent {
            id: "w1".into(),
            calls: calls.clone(),
            priority_class: Priority::Normal,
        }))
        .await;

        let pool_handle = pool.clone();
        let runner = tokio::spawn(async move { pool_handle.run().await });

        queue
            .enqueue(Task::new("t1", Priority::Normal, vec![]))
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);

        pool.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn unhealthy_worker_is_marked_failed() {
        struct NeverHealthy;
        #[async_trait]
        impl Agent for NeverHealthy {
            fn id(&self) -> &str {
                "bad"
            }
            async fn execute(&self, _task: &Task) -> Result<Vec<u8>> {
                Ok(vec![])
            }
            async fn health_check(&self) -> bool {
                false
            }
        }

        let queue: SharedTaskQueue = Arc::new(crate::queue::PriorityTaskQueue::new());
        let config = WorkerPoolConfig {
            health_check_interval: Duration::from_millis(10),
            max_consecutive_health_failures: 2,
            ..no_bootstrap_config()
        };
        let pool = Arc::new(WorkerPool::new(config, queue));
        pool.add_worker(Arc::new(NeverHealthy)).await;

        let pool_handle = pool.clone();
        let runner = tokio::spawn(async move { pool_handle.run().await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.failed_count, 1);

        pool.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn start_bootstraps_min_size_workers() {
        let queue: SharedTaskQueue = Arc::new(crate::queue::PriorityTaskQueue::new());
        let config = WorkerPoolConfig {
            min_size: 3,
            ..WorkerPoolConfig::default()
        };
        let pool = Arc::new(WorkerPool::new(config, queue));

        let pool_handle = pool.clone();
        let runner = tokio::spawn(async move { pool_handle.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.worker_count().await, 3);

        pool.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn add_worker_rejects_past_max_size() {
        let queue: SharedTaskQueue = Arc::new(crate::queue::PriorityTaskQueue::new());
        let config = WorkerPoolConfig {
            min_size: 0,
            max_size: 1,
            ..WorkerPoolConfig::default()
        };
        let pool = WorkerPool::new(config, queue);
        let calls = Arc::new(AtomicU32::new(0));
        assert!(
            pool.add_worker(Arc::new(EchoAgent {
                id: "w1".into(),
                calls: calls.clone(),
                priority_class: Priority::Normal,
            }))
            .await
        );
        assert!(
            !pool
                .add_worker(Arc::new(EchoAgent {
                    id: "w2".into(),
                    calls,
                    priority_class: Priority::Normal,
                }))
                .await
        );
        assert_eq!(pool.worker_count().await, 1);
    }

    #[tokio::test]
    async fn priority_aware_dispatch_skips_ineligible_worker() {
        let queue: SharedTaskQueue = Arc::new(crate::queue::PriorityTaskQueue::new());
        let config = WorkerPoolConfig {
            dispatch_strategy: DispatchStrategy::PriorityAware,
            ..no_bootstrap_config()
        };
        let pool = Arc::new(WorkerPool::new(config, queue.clone()));

        let low_calls = Arc::new(AtomicU32::new(0));
        let critical_calls = Arc::new(AtomicU32::new(0));
        pool.add_worker(Arc::new(EchoAgent {
            id: "low".into(),
            calls: low_calls.clone(),
            priority_class: Priority::Low,
        }))
        .await;
        pool.add_worker(Arc::new(EchoAgent {
            id: "critical".into(),
            calls: critical_calls.clone(),
            priority_class: Priority::Critical,
        }))
        .await;

        let pool_handle = pool.clone();
        let runner = tokio::spawn(async move { pool_handle.run().await });

        queue
            .enqueue(Task::new("urgent", Priority::Critical, vec![]))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(low_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(critical_calls.load(AtomicOrdering::SeqCst), 1);

        pool.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), runner).await;
    }

    #[tokio::test]
    async fn scale_down_victim_prefers_lowest_priority_idle_worker() {
        let queue: SharedTaskQueue = Arc::new(crate::queue::PriorityTaskQueue::new());
        let pool = WorkerPool::new(no_bootstrap_config(), queue);
        let calls = Arc::new(AtomicU32::new(0));
        pool.add_worker(Arc::new(EchoAgent {
            id: "high".into(),
            calls: calls.clone(),
            priority_class: Priority::High,
        }))
        .await;
        pool.add_worker(Arc::new(EchoAgent {
            id: "background".into(),
            calls: calls.clone(),
            priority_class: Priority::Background,
        }))
        .await;

        let victim = pool.scale_down_victim().await;
        assert_eq!(victim.as_deref(), Some("background"));
    }
}
