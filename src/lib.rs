//! # Spiral Kernel
//!
//! A concurrent runtime kernel for agent orchestration: a priority task
//! queue and worker pool, a multi-tier cache, coordination locks, a
//! topic-based message broker, a circuit breaker paired with a service
//! registry and load balancer, a rate limiter, a scheduler, a workflow
//! engine, and a metrics registry.
//!
//! Every subsystem is independent and exposed as a plain struct — there is
//! no global state. [`kernel::Kernel`] is the composition root that wires
//! them together from a [`config::KernelConfig`].

/// Generic agent contract consumed by the worker pool.
pub mod agent;
/// Load balancing strategies shared by the service registry and pool dispatch.
pub mod balance;
/// Message broker: topics, priority delivery, acknowledgement, persistence.
pub mod broker;
/// Multi-tier cache with pluggable eviction and TTL.
pub mod cache;
/// Circuit breaker state machine.
pub mod circuit_breaker;
/// Kernel-wide configuration.
pub mod config;
/// System-wide default values.
pub mod constants;
/// Error types and handling.
pub mod error;
/// Composition root wiring every subsystem together.
pub mod kernel;
/// Mutex/read/write coordination locks with lease expiry.
pub mod lock;
/// Typed metrics registry with JSON/Prometheus/text export.
pub mod metrics;
/// Priority-ordered worker pool with health checks and auto-scaling.
pub mod pool;
/// Priority task queue.
pub mod queue;
/// Sliding-window and token-bucket rate limiting.
pub mod rate_limit;
/// CPU/memory sampling used by the pool's auto-scale signal.
pub mod resource;
/// Service registry and load balancer.
pub mod registry;
/// Priority level shared across the task queue and message broker.
pub mod priority;
/// Cron/interval/one-shot job scheduler with dependency gating.
pub mod scheduler;
/// DAG-structured workflow execution engine.
pub mod workflow;

pub use error::{Result, SpiralError};
