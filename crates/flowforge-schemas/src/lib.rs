//! Wire types and data model shared by every flowforge crate.
//!
//! This crate carries no runtime logic: it is the source of truth for what
//! crosses the bus (`envelope`, `agent_envelope`, `task_result`) and what gets
//! persisted (`workflow`, `state`). Everything here is `Serialize`/
//! `Deserialize` and trivially `Clone`.

pub mod agent_envelope;
pub mod envelope;
pub mod state;
pub mod task_result;
pub mod workflow;

pub use agent_envelope::{
    builtin_agents, is_valid_agent_type, AgentEnvelope, AgentEnvelopeError, Priority, TaskStatus,
    WorkflowContext,
};
pub use envelope::{
    create_envelope, has_exhausted_retries, parse, retry_envelope, serialize, validate,
    Envelope, EnvelopeError, EnvelopeMeta, PayloadValidator, SchemaRegistry, SchemaRegistryBuilder,
};
pub use state::{RecoveryCheckpoint, StateSnapshot, WorkflowLock};
pub use task_result::{ResultMetrics, ResultStatus, TaskResult};
pub use workflow::{
    workflow_types, DefinitionError, OnFailure, OnSuccess, RetryStrategy, StageDefinition,
    Workflow, WorkflowDefinition, WorkflowStatus,
};
