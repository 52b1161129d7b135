//! System-wide default values shared across kernel components.
//!
//! Every constant here is overridable through the corresponding field on a
//! component's config struct (see [`crate::config`]); these are only the
//! defaults used when a config is built with `Default::default()`.

// Task queue / worker pool
pub const TASK_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MIN_POOL_SIZE: usize = 2;
pub const DEFAULT_MAX_POOL_SIZE: usize = 16;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;
pub const DEFAULT_AUTO_SCALE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_CONSECUTIVE_HEALTH_FAILURES: u32 = 3;
pub const DEFAULT_SCALE_UP_CPU_WATERMARK: f64 = 70.0;
pub const DEFAULT_SCALE_DOWN_LOAD_THRESHOLD: f64 = 0.3;

// Cache
pub const DEFAULT_CACHE_TIER_MAX_SIZE: usize = 1000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

// Lock manager
pub const LOCK_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 30;

// Message broker
pub const DEFAULT_MAX_MESSAGE_RETRIES: u32 = 3;
pub const BROKER_RECEIVE_POLL_INTERVAL_MS: u64 = 10;

// Service registry
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

// Rate limiter
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// Scheduler
pub const SCHEDULER_TICK_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_CONSECUTIVE_TASK_FAILURES: u32 = 3;

// Workflow engine
pub const DEFAULT_WORKFLOW_CONCURRENCY: usize = 8;
pub const DEFAULT_NODE_MAX_RETRIES: u32 = 3;
pub const NODE_RETRY_BASE_BACKOFF_MS: u64 = 200;

// Metrics
pub const DEFAULT_HISTOGRAM_SAMPLE_CAP: usize = 10_000;
