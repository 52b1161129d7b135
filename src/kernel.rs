//! Composition root (spec.md §9): the kernel is a plain struct whose
//! subsystems are fields, wired explicitly in [`Kernel::new`]. No global
//! singletons, no service locator — every component a caller needs is
//! reached through a `Kernel` value they were handed.

use std::sync::Arc;

use crate::broker::MessageBroker;
use crate::cache::{MultiTierCache, TierConfig};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::KernelConfig;
use crate::lock::LockManager;
use crate::metrics::MetricsRegistry;
use crate::pool::WorkerPool;
use crate::queue::{PriorityTaskQueue, SharedTaskQueue};
use crate::rate_limit::MultiDimensionalRateLimiter;
use crate::registry::ServiceRegistry;
use crate::scheduler::Scheduler;
use crate::workflow::Workflow;

/// Every runtime subsystem, constructed once from a [`KernelConfig`] and
/// shared from then on via `Arc`.
pub struct Kernel {
    pub queue: SharedTaskQueue,
    pub pool: Arc<WorkerPool>,
    pub cache: Arc<MultiTierCache<String, Vec<u8>>>,
    pub locks: Arc<LockManager>,
    pub broker: Arc<MessageBroker>,
    pub registry: Arc<ServiceRegistry>,
    pub rate_limiter: Arc<MultiDimensionalRateLimiter>,
    pub metrics: Arc<MetricsRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub workflow: Arc<Workflow>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let queue: SharedTaskQueue = Arc::new(PriorityTaskQueue::new());
        let pool = Arc::new(WorkerPool::new(config.pool, queue.clone()));

        let tiers = config
            .cache
            .tiers
            .into_iter()
            .map(|t| TierConfig {
                max_size: t.max_size,
                policy: t.policy,
                default_ttl: t.default_ttl,
            })
            .collect();
        let cache = Arc::new(MultiTierCache::new(tiers));

        let locks = Arc::new(LockManager::new());
        let broker = Arc::new(MessageBroker::new(config.broker));
        let registry = Arc::new(ServiceRegistry::new(config.registry.heartbeat_timeout));
        let rate_limiter = Arc::new(MultiDimensionalRateLimiter::new());
        let metrics = Arc::new(MetricsRegistry::new(config.metrics.histogram_sample_cap));
        let scheduler = Arc::new(Scheduler::new(config.scheduler.tick_interval));
        let workflow = Arc::new(Workflow::new(config.workflow.concurrency));

        Self {
            queue,
            pool,
            cache,
            locks,
            broker,
            registry,
            rate_limiter,
            metrics,
            scheduler,
            workflow,
        }
    }

    /// Constructs one named [`CircuitBreaker`] using this kernel's
    /// configured defaults. Call sites that guard independent external
    /// calls (per spec.md §4.3, each guarded call gets its own breaker)
    /// should keep their own instance rather than sharing state.
    pub fn circuit_breaker(&self, name: impl Into<String>, config: crate::circuit_breaker::CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(name, config)
    }

    /// Replays persisted messages and starts the pool dispatch/health/scale
    /// loops and the scheduler tick loop. Runs until the process is killed
    /// or [`WorkerPool::shutdown`] is called.
    pub async fn run(self: &Arc<Self>) -> crate::error::Result<()> {
        self.broker.recover().await?;

        let pool = self.pool.clone();
        let pool_task = tokio::spawn(async move { pool.run().await });

        let scheduler = self.scheduler.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run().await });

        tokio::select! {
            _ = pool_task => {}
            _ = scheduler_task => {}
        }

        Ok(())
    }
}
