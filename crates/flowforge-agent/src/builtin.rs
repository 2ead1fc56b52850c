//! Convenience constructors for the built-in agent types (spec.md §3
//! `builtin_agents`). Each simply wires up an [`AgentRuntime`] with the
//! right topic and defaults; the actual task logic is supplied by the
//! caller, since what "scaffold" or "e2e" means is deployment-specific.

use std::sync::Arc;

use flowforge_core::bus::MessageBus;
use flowforge_core::kv::KvStore;
use flowforge_schemas::builtin_agents;

use crate::runtime::{AgentRuntime, AgentRuntimeConfig, ExecutionOutcome, TaskHandler};
use std::future::Future;

fn config_for(agent_type: &str) -> AgentRuntimeConfig {
    AgentRuntimeConfig::new(agent_type)
}

pub fn scaffold_runtime<F, Fut>(bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>, handler: F) -> AgentRuntime
where
    F: Fn(flowforge_schemas::AgentEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionOutcome, String>> + Send + 'static,
{
    AgentRuntime::new(config_for(builtin_agents::SCAFFOLD), bus, kv, handler)
}

pub fn validation_runtime<F, Fut>(bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>, handler: F) -> AgentRuntime
where
    F: Fn(flowforge_schemas::AgentEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionOutcome, String>> + Send + 'static,
{
    AgentRuntime::new(
        config_for(builtin_agents::VALIDATION).with_retry_policy(
            flowforge_core::retry::RetryPolicy::standard().with_max_attempts(2),
        ),
        bus,
        kv,
        handler,
    )
}

/// `max_retries = 1, timeout = 15m`: end-to-end suites are slow and rarely
/// flaky enough to benefit from a deep retry budget.
pub fn e2e_runtime<F, Fut>(bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>, handler: F) -> AgentRuntime
where
    F: Fn(flowforge_schemas::AgentEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionOutcome, String>> + Send + 'static,
{
    AgentRuntime::new(
        config_for(builtin_agents::E2E)
            .with_max_concurrency(4)
            .with_retry_policy(flowforge_core::retry::RetryPolicy::standard().with_max_attempts(1)),
        bus,
        kv,
        handler,
    )
}

pub fn deployment_runtime<F, Fut>(bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>, handler: F) -> AgentRuntime
where
    F: Fn(flowforge_schemas::AgentEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionOutcome, String>> + Send + 'static,
{
    AgentRuntime::new(
        config_for(builtin_agents::DEPLOYMENT).with_max_concurrency(1),
        bus,
        kv,
        handler,
    )
}

/// Echo handler used by integration tests and local smoke runs: always
/// succeeds, returning the task payload unchanged.
pub fn echo_handler() -> TaskHandler {
    Arc::new(|task| {
        Box::pin(async move { Ok(ExecutionOutcome::success(task.payload)) })
    })
}
