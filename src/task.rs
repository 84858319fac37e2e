//! Durable task model.

pub use self::scheduler::{Scheduler, TaskContext, TaskHandle, TaskRegistry, TaskType};
pub use self::store::{TaskNotice, TaskNoticeKind, TaskStore};

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VaultError;

pub mod scheduler;
pub mod store;

/// Default priority assigned to tasks that do not ask for one.
pub const DEFAULT_PRIORITY: i64 = 128;

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Background,
    Complete,
    Error,
    Cancelled,
    Dead,
}

impl TaskStatus {
    /// Returns the string representation stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "OPEN",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Background => "BACKGROUND",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Dead => "DEAD",
        }
    }

    /// Returns `true` if no further transitions can occur.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Error | TaskStatus::Cancelled | TaskStatus::Dead
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TaskStatus::Open),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "BLOCKED" => Ok(TaskStatus::Blocked),
            "BACKGROUND" => Ok(TaskStatus::Background),
            "COMPLETE" => Ok(TaskStatus::Complete),
            "ERROR" => Ok(TaskStatus::Error),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            "DEAD" => Ok(TaskStatus::Dead),
            other => Err(anyhow!("unrecognized task status: {}", other)),
        }
    }
}

/// A task execution failure, with the retry decision attached to the failure
/// itself.
#[derive(Clone, Debug, thiserror::Error, Deserialize, Serialize)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    /// A failure worth retrying (transient I/O, contention, and the like).
    pub fn retryable(message: impl Into<String>) -> Self {
        TaskError {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not succeed on retry.
    pub fn terminal(message: impl Into<String>) -> Self {
        TaskError {
            message: message.into(),
            retryable: false,
        }
    }

    /// The JSON recorded in `Task.output` for terminal failures.
    pub fn to_output(&self, task_type: &str) -> Value {
        serde_json::json!({
            "message": self.message,
            "type": task_type,
            "retryable": self.retryable,
        })
    }
}

impl From<VaultError> for TaskError {
    fn from(err: VaultError) -> Self {
        TaskError {
            retryable: err.retryable(),
            message: err.to_string(),
        }
    }
}

/// What a worker reports after running a task.
#[derive(Debug)]
pub enum Outcome {
    /// The task finished; record its output.
    Complete(Value),
    /// The task is waiting on its dependencies (typically subtasks it just
    /// submitted) and should be re-opened once they complete.
    Blocked,
    /// The task parked itself; re-open it after the timeout unless released
    /// earlier.
    Background(Duration),
    /// The task failed.
    Failed(TaskError),
}

/// A task row as stored in the queue.
#[derive(Clone, Debug)]
pub struct TaskRow {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub input: Value,
    pub output: Option<Value>,
    pub retryable: Option<bool>,
    pub retry_count: i64,
    pub executor_node: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Background,
            TaskStatus::Complete,
            TaskStatus::Error,
            TaskStatus::Cancelled,
            TaskStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Dead.is_terminal());
        assert!(!TaskStatus::Background.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
    }

    #[test]
    fn error_output_shape() {
        let output = TaskError::terminal("boom").to_output("ingest_file");
        assert_eq!(output["message"], "boom");
        assert_eq!(output["type"], "ingest_file");
        assert_eq!(output["retryable"], false);
    }
}
