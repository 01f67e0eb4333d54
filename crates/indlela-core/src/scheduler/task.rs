//! Task types and lifecycle events for the scheduler.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Unique identifier for a task.
pub type TaskId = String;

/// Queue a task is admitted through. Downloads and inference use distinct
/// queues so IO never blocks inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Llm,
    Ocr,
    Stt,
    Tts,
    Embedding,
    Download,
    Verify,
}

impl TaskType {
    pub fn all() -> &'static [TaskType] {
        &[
            Self::Llm,
            Self::Ocr,
            Self::Stt,
            Self::Tts,
            Self::Embedding,
            Self::Download,
            Self::Verify,
        ]
    }

    /// Default concurrent-running cap for this queue.
    pub fn default_cap(&self) -> usize {
        match self {
            Self::Llm => 1,
            Self::Ocr => 2,
            Self::Stt => 2,
            Self::Tts => 1,
            Self::Embedding => 2,
            Self::Download => 3,
            Self::Verify => 2,
        }
    }
}

/// Advisory resource classification; used for queue assignment and
/// reporting, never as a scheduling key by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    CpuBound,
    GpuBound,
    IoBound,
}

/// Priority level for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Result payload produced by a task thunk.
#[derive(Debug, Clone)]
pub enum TaskValue {
    None,
    Text(String),
    Embedding(Vec<f32>),
    Audio { samples: Vec<f32>, sample_rate: u32 },
    Path(PathBuf),
    Json(serde_json::Value),
}

/// Parameters for submitting a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub priority: Priority,
    pub resource_type: ResourceType,
    /// Armed when the task transitions to running.
    pub timeout: Option<Duration>,
    pub cancellable: bool,
}

impl TaskSpec {
    pub fn new(task_type: TaskType) -> Self {
        let resource_type = match task_type {
            TaskType::Download | TaskType::Verify => ResourceType::IoBound,
            _ => ResourceType::CpuBound,
        };
        Self {
            task_type,
            priority: Priority::Normal,
            resource_type,
            timeout: None,
            cancellable: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn not_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }
}

/// Lifecycle event kind on the scheduler's broadcast stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventKind {
    Submitted,
    Started,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// One lifecycle event for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl TaskEvent {
    pub fn now(kind: TaskEventKind, task_id: TaskId) -> Self {
        Self {
            kind,
            task_id,
            timestamp: Utc::now(),
            error: None,
        }
    }
}

/// Terminal outcome delivered to the submitter.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub value: Option<TaskValue>,
    pub error: Option<WireError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_caps() {
        assert_eq!(TaskType::Llm.default_cap(), 1);
        assert_eq!(TaskType::Download.default_cap(), 3);
        assert_eq!(TaskType::Verify.default_cap(), 2);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            assert!(status.is_terminal());
        }
    }
}
