//! Generic agent contract used by the worker pool (spec.md §4.2).
//!
//! The kernel is agent-implementation-agnostic: it only needs something that
//! can execute an opaque task payload and report its own health.

use async_trait::async_trait;

use crate::error::Result;
use crate::priority::Priority;
use crate::queue::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Pending,
    Initializing,
    Running,
    Idle,
    Busy,
    HealthCheck,
    Stopping,
    Stopped,
    Failed,
}

/// A pluggable unit of work execution. Implementations decode `Task::payload`
/// however their caller and agents have agreed.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, task: &Task) -> Result<Vec<u8>>;

    /// Cheap liveness check, polled by the pool's health loop. The default
    /// always reports healthy; agents backed by external resources should
    /// override this.
    async fn health_check(&self) -> bool {
        true
    }

    /// This agent's priority class, used by priority-aware dispatch: an
    /// agent is eligible for a task iff `priority_class() <= task.priority`
    /// (lower numeric value outranks higher, per [`Priority`]'s ordering).
    /// Defaults to `Normal`, which admits every non-`Low`/`Background` task.
    fn priority_class(&self) -> Priority {
        Priority::Normal
    }
}
