//! AgentEnvelope — the typed task message addressed to a specific agent type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

static AGENT_TYPE_PATTERN: &str = r"^[a-z0-9]+(-[a-z0-9]+)*$";

fn agent_type_regex() -> regex::Regex {
    regex::Regex::new(AGENT_TYPE_PATTERN).expect("static agent type pattern is valid")
}

/// Check that an `agent_type` is kebab-case, per spec.md §3.
pub fn is_valid_agent_type(agent_type: &str) -> bool {
    !agent_type.is_empty() && agent_type_regex().is_match(agent_type)
}

/// Built-in agent type identifiers. Custom agent types are any other
/// kebab-case string and require no central registration beyond appearing
/// in a [`crate::workflow::WorkflowDefinition`].
pub mod builtin_agents {
    pub const INITIALIZATION: &str = "initialization";
    pub const SCAFFOLD: &str = "scaffold";
    pub const DEPENDENCY_INSTALLATION: &str = "dependency-installation";
    pub const IMPLEMENTATION: &str = "implementation";
    pub const VALIDATION: &str = "validation";
    pub const E2E: &str = "e2e";
    pub const INTEGRATION: &str = "integration";
    pub const DEPLOYMENT: &str = "deployment";
    pub const MONITORING: &str = "monitoring";
    pub const DEBUG: &str = "debug";
    pub const RECOVERY: &str = "recovery";

    pub const ALL: &[&str] = &[
        INITIALIZATION,
        SCAFFOLD,
        DEPENDENCY_INSTALLATION,
        IMPLEMENTATION,
        VALIDATION,
        E2E,
        INTEGRATION,
        DEPLOYMENT,
        MONITORING,
        DEBUG,
        RECOVERY,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failure,
    Partial,
    Timeout,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Partial | Self::Timeout | Self::Cancelled
        )
    }
}

/// Snapshot of the workflow a task was dispatched on behalf of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub workflow_type: String,
    pub workflow_name: String,
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_outputs: Option<Value>,
}

/// A task dispatched to a specific agent type.
///
/// `payload` is a discriminated union keyed by `agent_type` in principle, but
/// is carried here as an opaque `Value`: the core never inspects payload
/// contents beyond validation via the schema registry keyed on `agent_type`
/// (spec.md §3, §9 "discriminated union of agent envelopes").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEnvelope {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub agent_type: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub workflow_context: WorkflowContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    pub envelope_version: u32,
    pub payload: Value,
}

/// Errors raised validating an [`AgentEnvelope`] against spec.md §3.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AgentEnvelopeError {
    #[error("agent_type {0:?} is not kebab-case")]
    InvalidAgentType(String),

    #[error("max_retries {0} is out of range [0,10]")]
    MaxRetriesOutOfRange(u32),

    #[error("timeout_ms {0} is below the minimum of 1000")]
    TimeoutTooShort(u64),
}

impl AgentEnvelope {
    pub fn validate(&self) -> Result<(), AgentEnvelopeError> {
        if !is_valid_agent_type(&self.agent_type) {
            return Err(AgentEnvelopeError::InvalidAgentType(self.agent_type.clone()));
        }
        if self.max_retries > 10 {
            return Err(AgentEnvelopeError::MaxRetriesOutOfRange(self.max_retries));
        }
        if self.timeout_ms < 1000 {
            return Err(AgentEnvelopeError::TimeoutTooShort(self.timeout_ms));
        }
        Ok(())
    }
}
