//! TaskResult — what an agent reports back after executing a task.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent_envelope::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Partial,
    Timeout,
}

impl From<ResultStatus> for TaskStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Success => TaskStatus::Success,
            ResultStatus::Failure => TaskStatus::Failure,
            ResultStatus::Partial => TaskStatus::Partial,
            ResultStatus::Timeout => TaskStatus::Timeout,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetrics {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_calls: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_id: String,
    pub status: ResultStatus,
    pub output: Value,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub metrics: ResultMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ResultStatus::Success)
    }
}
