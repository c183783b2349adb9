use async_trait::async_trait;

use crate::error::Result;

pub mod kie;

/// Normalized lifecycle of a remote generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    /// Collapse the upstream API's state vocabulary onto ours. The API uses
    /// different raw states per model family; anything unrecognized is
    /// treated as still in flight.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "waiting" | "queuing" | "pending" => TaskState::Pending,
            "generating" | "processing" => TaskState::Processing,
            "success" | "completed" => TaskState::Completed,
            "fail" | "failed" => TaskState::Failed,
            _ => TaskState::Processing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

/// Result of polling one remote task, normalized across envelope shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,
    pub result_url: Option<String>,
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn is_done(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }
}

/// The remote operations the pipeline driver depends on. `kie::KieClient`
/// is the production implementation; tests substitute an in-memory fake.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Create a task from an opaque payload, returning its id.
    async fn submit(&self, request: &serde_json::Value) -> Result<String>;

    /// Query current task state.
    async fn poll(&self, task_id: &str) -> Result<TaskStatus>;

    /// Fetch a completed artifact.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Push file bytes to remote storage and return their public URL.
    async fn upload(&self, bytes: Vec<u8>, filename: &str) -> Result<String>;
}
