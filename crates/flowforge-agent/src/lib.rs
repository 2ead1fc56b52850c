//! Agent runtime base shared by every agent type: subscribe to its task
//! topic, validate incoming envelopes, execute with retry, report the
//! result, and expose health to the orchestrator and metrics layer.

pub mod builtin;
pub mod health;
pub mod registry;
pub mod runtime;

pub use health::{AgentHealth, HealthState, HealthTracker};
pub use registry::{register, deregister, heartbeat_loop, AgentRegistration};
pub use runtime::{
    AgentRuntime, AgentRuntimeConfig, AgentRuntimeError, ExecutionOutcome, TaskHandler,
};
