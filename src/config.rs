//! Kernel-wide configuration (spec.md §9's explicit-DI mandate).
//!
//! Every component gets its own config struct with a spec-derived
//! `Default`. There is deliberately no file/env parsing layer here — config
//! construction is `KernelConfig::default()` plus struct-update syntax,
//! consistent with this spec's configuration non-goal.

use std::time::Duration;

use crate::broker::BrokerConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::pool::WorkerPoolConfig;

#[derive(Debug, Clone)]
pub struct CacheTierSpec {
    pub max_size: usize,
    pub policy: crate::cache::EvictionPolicy,
    pub default_ttl: Option<Duration>,
}

impl Default for CacheTierSpec {
    fn default() -> Self {
        Self {
            max_size: crate::constants::DEFAULT_CACHE_TIER_MAX_SIZE,
            policy: crate::cache::EvictionPolicy::Lru,
            default_ttl: Some(Duration::from_secs(crate::constants::DEFAULT_CACHE_TTL_SECS)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub tiers: Vec<CacheTierSpec>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                CacheTierSpec {
                    max_size: 100,
                    ..Default::default()
                },
                CacheTierSpec {
                    max_size: 1000,
                    ..Default::default()
                },
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(crate::constants::DEFAULT_LEASE_DURATION_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(
                crate::constants::DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(crate::constants::SCHEDULER_TICK_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub concurrency: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::constants::DEFAULT_WORKFLOW_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub histogram_sample_cap: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_sample_cap: crate::constants::DEFAULT_HISTOGRAM_SAMPLE_CAP,
        }
    }
}

/// Aggregates every component's config. Construct with
/// `KernelConfig::default()`, then override individual fields with
/// struct-update syntax before passing to [`crate::kernel::Kernel::new`].
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    pub pool: WorkerPoolConfig,
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub broker: BrokerConfig,
    pub registry: RegistryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub scheduler: SchedulerConfig,
    pub workflow: WorkflowConfig,
    pub metrics: MetricsConfig,
}
