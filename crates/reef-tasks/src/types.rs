use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority levels, polled urgent-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Poll order, highest first.
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    /// Statuses that are re-enqueued after a restart.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Retrying
        )
    }
}

/// Metadata record for one task. Persisted alongside the opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Per-task timeout in seconds.
    pub timeout_secs: u64,
    /// Progress in [0, 1], monotone per attempt.
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

/// Exponential backoff before a retry, capped at 60 seconds.
pub fn retry_backoff_secs(retry_count: u32) -> u64 {
    2u64.saturating_pow(retry_count).min(60)
}

/// Per-priority queue lengths plus lifetime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub urgent_queue: usize,
    pub high_queue: usize,
    pub normal_queue: usize,
    pub low_queue: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn total_queued(&self) -> usize {
        self.urgent_queue + self.high_queue + self.normal_queue + self.low_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(retry_backoff_secs(1), 2);
        assert_eq!(retry_backoff_secs(3), 8);
        assert_eq!(retry_backoff_secs(6), 60);
        assert_eq!(retry_backoff_secs(30), 60);
    }

    #[test]
    fn recoverable_statuses() {
        assert!(TaskStatus::Running.is_recoverable());
        assert!(TaskStatus::Retrying.is_recoverable());
        assert!(!TaskStatus::Completed.is_recoverable());
        assert!(!TaskStatus::Cancelled.is_recoverable());
    }
}
