use serde::{Deserialize, Serialize};

/// Dispatch priority shared by the task queue and the message broker.
///
/// Ordered so the derived `Ord` sorts earlier-dispatched priorities first:
/// `Critical < High < Normal < Low < Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}
