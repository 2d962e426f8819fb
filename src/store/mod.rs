//! Task status storage trait and types.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{PayloadItem, ServiceName};

pub use sqlite::SqliteStatusStore;

/// Surrogate identifier for a service request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub i64);

/// Lifecycle state shared by tasks and service requests.
///
/// Transitions are monotone: `Pending` -> `InProgress` -> `Completed` or
/// `Failed`, with `InProgress` skippable. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    /// Whether a write from `self` to `next` is allowed. Writes that would
    /// leave a terminal state or regress are not.
    pub fn can_transition(&self, next: Status) -> bool {
        if *self == next {
            return false;
        }
        match self {
            Status::Pending => true,
            Status::InProgress => next.is_terminal(),
            Status::Completed | Status::Failed => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A task row.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: String,
    pub description: Option<String>,
    pub payload: Vec<PayloadItem>,
    pub status: Status,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task row together with its service requests.
#[derive(Debug, Clone)]
pub struct TaskDetail {
    pub task: TaskRecord,
    pub service_requests: Vec<ServiceRequestRecord>,
}

/// A service request row.
#[derive(Debug, Clone)]
pub struct ServiceRequestRecord {
    pub id: RequestId,
    pub task_id: String,
    pub service_name: ServiceName,
    pub scenario_id: Option<String>,
    pub business_type_id: Option<String>,
    pub status: Status,
    pub request_payload: serde_json::Value,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Explicit task id; a fresh UUID is assigned when absent.
    pub task_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub payload: Vec<PayloadItem>,
}

/// Input for creating a service request under a task.
#[derive(Debug, Clone)]
pub struct NewServiceRequest {
    pub service_name: ServiceName,
    pub scenario_id: Option<String>,
    pub business_type_id: Option<String>,
    pub request_payload: serde_json::Value,
}

/// Error type for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("service request not found: {0}")]
    RequestNotFound(i64),

    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Trait for task status storage backends.
///
/// Implementations must serialize conflicting writes to the same row and let
/// writes to different rows proceed in parallel. Every status write must
/// refresh `updated_at`.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Create a task with status `Pending`.
    async fn create_task(&self, new_task: NewTask) -> Result<TaskRecord, StoreError>;

    /// Create a service request with status `Pending` under an existing task.
    async fn create_service_request(
        &self,
        task_id: &str,
        request: NewServiceRequest,
    ) -> Result<ServiceRequestRecord, StoreError>;

    /// Update a task's status. A write matching the current terminal state is
    /// a no-op success; disallowed transitions are ignored with a warning.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: Status,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Update a service request's status and run the rollup against the
    /// owning task. Returns the task's new status when it transitioned.
    async fn update_service_request_status(
        &self,
        id: RequestId,
        status: Status,
        response_payload: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<Option<Status>, StoreError>;

    /// Fetch a task with its service requests.
    async fn get_task(&self, task_id: &str) -> Result<Option<TaskDetail>, StoreError>;

    /// List all tasks, newest first.
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;
}

/// The rollup rule: derive the owning task's next status from its service
/// requests. `None` means no transition.
pub(crate) fn rollup(statuses: &[Status]) -> Option<Status> {
    if statuses.is_empty() {
        return None;
    }
    if statuses.iter().any(|s| *s == Status::Failed) {
        Some(Status::Failed)
    } else if statuses.iter().all(|s| *s == Status::Completed) {
        Some(Status::Completed)
    } else {
        None
    }
}
