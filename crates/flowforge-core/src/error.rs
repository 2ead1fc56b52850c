//! Error taxonomy shared by every port and adapter (spec.md §7).

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: expected version {expected}, got {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("lock already held by {holder}")]
    LockHeld { holder: String },

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("agent execution failed for task {task_id}: {reason}")]
    AgentExecution { task_id: Uuid, reason: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("routed to dead letter queue: {0}")]
    DeadLetter(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
