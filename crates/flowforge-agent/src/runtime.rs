//! Agent runtime: subscribe -> validate -> execute (with retry) -> report
//! -> health -> cleanup lifecycle shared by every agent type.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowforge_core::bus::{MessageBus, PublishOptions, SubscribeOptions};
use flowforge_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use flowforge_core::error::CoreError;
use flowforge_core::idempotency::{deduplicate, DEFAULT_DEDUP_TTL};
use flowforge_core::kv::KvStore;
use flowforge_core::retry::{retry, RetryPolicy};
use flowforge_schemas::agent_envelope::AgentEnvelope;
use flowforge_schemas::envelope::{create_envelope, Envelope};
use flowforge_schemas::task_result::{ResultMetrics, ResultStatus, TaskResult};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::health::{HealthState, HealthTracker};

#[derive(Debug, thiserror::Error)]
pub enum AgentRuntimeError {
    #[error("agent runtime is already running")]
    AlreadyRunning,

    #[error("agent runtime is not running")]
    NotRunning,

    #[error("graceful shutdown timed out with {0} task(s) still in flight")]
    ShutdownTimeout(usize),

    #[error("bus error: {0}")]
    Bus(#[from] CoreError),
}

/// Output of one task execution, before it is wrapped into a [`TaskResult`].
pub struct ExecutionOutcome {
    pub status: ResultStatus,
    pub output: Value,
    pub errors: Vec<String>,
    pub artifacts: Vec<String>,
    pub next_stage: Option<String>,
    pub next_stage_payload: Option<Value>,
}

impl ExecutionOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            output,
            errors: vec![],
            artifacts: vec![],
            next_stage: None,
            next_stage_payload: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            output: Value::Null,
            errors: vec![error.into()],
            artifacts: vec![],
            next_stage: None,
            next_stage_payload: None,
        }
    }
}

pub type TaskHandler = Arc<
    dyn Fn(AgentEnvelope) -> Pin<Box<dyn Future<Output = Result<ExecutionOutcome, String>> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone)]
pub struct AgentRuntimeConfig {
    pub agent_id: String,
    pub agent_type: String,
    pub max_concurrency: usize,
    pub task_topic: String,
    pub result_topic: String,
    pub retry_policy: RetryPolicy,
    pub heartbeat_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Guards every outbound model call the handler makes (spec.md §4.5/§4.6).
    pub circuit_breaker: CircuitBreakerConfig,
}

impl AgentRuntimeConfig {
    pub fn new(agent_type: impl Into<String>) -> Self {
        let agent_type = agent_type.into();
        Self {
            agent_id: format!("{agent_type}-{}", uuid::Uuid::now_v7()),
            // Canonical topic naming (spec.md §6, REDESIGN FLAGS): always
            // `agent:<type>:tasks`, never a locally-formatted alternate.
            task_topic: format!("agent:{agent_type}:tasks"),
            result_topic: "orchestrator:results".to_string(),
            agent_type,
            max_concurrency: 10,
            retry_policy: RetryPolicy::standard(),
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// Runs one agent type's task loop against the bus.
pub struct AgentRuntime {
    config: AgentRuntimeConfig,
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KvStore>,
    handler: TaskHandler,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthTracker>,
    active_tasks: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn new<F, Fut>(config: AgentRuntimeConfig, bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>, handler: F) -> Self
    where
        F: Fn(AgentEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionOutcome, String>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health = Arc::new(HealthTracker::new(
            config.agent_id.clone(),
            config.agent_type.clone(),
            config.max_concurrency,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            format!("agent:{}:model", config.agent_type),
            config.circuit_breaker.clone(),
            Arc::clone(&kv),
        ));
        Self {
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            handler: Arc::new(move |env| Box::pin(handler(env))),
            breaker,
            config,
            bus,
            kv,
            health,
            shutdown_tx,
            shutdown_rx,
            loop_handle: std::sync::Mutex::new(None),
            heartbeat_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.health)
    }

    #[instrument(skip(self), fields(agent_id = %self.config.agent_id, agent_type = %self.config.agent_type))]
    pub async fn start(&self) -> Result<(), AgentRuntimeError> {
        if self.health.check(false).state != HealthState::Starting {
            return Err(AgentRuntimeError::AlreadyRunning);
        }

        let mut stream = self
            .bus
            .subscribe(&self.config.task_topic, SubscribeOptions::default())
            .await?;

        info!(
            agent_type = %self.config.agent_type,
            max_concurrency = self.config.max_concurrency,
            "starting agent runtime"
        );

        self.health.set_state(HealthState::Ready);
        self.start_heartbeat_loop();

        let bus = Arc::clone(&self.bus);
        let kv = Arc::clone(&self.kv);
        let handler = Arc::clone(&self.handler);
        let breaker = Arc::clone(&self.breaker);
        let health = Arc::clone(&self.health);
        let active_tasks = Arc::clone(&self.active_tasks);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("agent task loop: shutdown requested");
                            break;
                        }
                    }
                    envelope = stream.next() => {
                        let Some(envelope) = envelope else { break };
                        match envelope {
                            Ok(envelope) => {
                                // Deduplicate by the bus envelope's own id before decoding
                                // the payload, so a redelivered envelope (spec.md §4.2
                                // at-least-once delivery) is executed at most once.
                                let envelope_id = envelope.id;
                                match deduplicate(kv.as_ref(), "agent-envelope", envelope_id, DEFAULT_DEDUP_TTL).await {
                                    Ok(true) => {}
                                    Ok(false) => {
                                        debug!(%envelope_id, "duplicate envelope delivery, skipping");
                                        continue;
                                    }
                                    Err(e) => {
                                        warn!(error = %e, %envelope_id, "dedup ledger check failed, processing anyway");
                                    }
                                }

                                let Some(task) = decode_task(envelope) else { continue };
                                let permit = match Arc::clone(&active_tasks).try_acquire_owned() {
                                    Ok(p) => p,
                                    Err(_) => {
                                        warn!("at max concurrency, dropping delivery for redelivery");
                                        continue;
                                    }
                                };
                                health.set_load(config.max_concurrency - active_tasks.available_permits());

                                let bus = Arc::clone(&bus);
                                let handler = Arc::clone(&handler);
                                let breaker = Arc::clone(&breaker);
                                let health = Arc::clone(&health);
                                let config = config.clone();

                                tokio::spawn(async move {
                                    execute_and_report(config, bus, handler, breaker, task).await;
                                    health.set_load(health.check(false).current_load.saturating_sub(1));
                                    drop(permit);
                                });
                            }
                            Err(e) => error!(error = %e, "bus delivery error"),
                        }
                    }
                }
            }
            debug!("agent task loop exited");
        });

        *self.loop_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn start_heartbeat_loop(&self) {
        let health = Arc::clone(&self.health);
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => health.heartbeat(),
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.heartbeat_handle.lock().unwrap() = Some(handle);
    }

    /// Stop accepting new tasks and wait (up to `shutdown_timeout`) for
    /// in-flight tasks to finish.
    #[instrument(skip(self), fields(agent_id = %self.config.agent_id))]
    pub async fn shutdown(&self) -> Result<(), AgentRuntimeError> {
        self.health.set_state(HealthState::Draining);
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let in_flight = self.config.max_concurrency - self.active_tasks.available_permits();
            if in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentRuntimeError::ShutdownTimeout(in_flight));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.health.set_state(HealthState::Stopped);
        info!(agent_id = %self.config.agent_id, "agent runtime stopped");
        Ok(())
    }
}

fn decode_task(envelope: Envelope) -> Option<AgentEnvelope> {
    match serde_json::from_value::<AgentEnvelope>(envelope.payload) {
        Ok(task) => match task.validate() {
            Ok(()) => Some(task),
            Err(e) => {
                warn!(error = %e, "dropping invalid agent envelope");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "dropping undecodable agent envelope");
            None
        }
    }
}

async fn execute_and_report(
    config: AgentRuntimeConfig,
    bus: Arc<dyn MessageBus>,
    handler: TaskHandler,
    breaker: Arc<CircuitBreaker>,
    task: AgentEnvelope,
) {
    let started_at = Utc::now();
    let task_id = task.task_id;
    let workflow_id = task.workflow_id;
    // spec.md §5: every bus subscribe handler runs under a per-message
    // budget of max(timeout_ms, 30s).
    let call_budget = Duration::from_millis(task.timeout_ms).max(Duration::from_secs(30));

    let outcome = retry(&config.retry_policy, |_attempt| {
        let handler = Arc::clone(&handler);
        let breaker = Arc::clone(&breaker);
        let task = task.clone();
        async move {
            let permit = match breaker.allow().await {
                Ok(permit) => permit,
                Err(_) => return Err("CIRCUIT_OPEN".to_string()),
            };

            match tokio::time::timeout(call_budget, handler(task)).await {
                Ok(Ok(outcome)) => {
                    let _ = permit.success().await;
                    Ok(outcome)
                }
                Ok(Err(e)) => {
                    let _ = permit.failure().await;
                    Err(e)
                }
                Err(_) => {
                    let _ = permit.failure().await;
                    Err(format!("task {task_id} exceeded its {}ms budget", call_budget.as_millis()))
                }
            }
        }
    })
    .await;

    let exhausted_retries = outcome.is_err();
    let (status, output, errors, artifacts, next_stage, next_stage_payload) = match outcome {
        Ok(o) => (o.status, o.output, o.errors, o.artifacts, o.next_stage, o.next_stage_payload),
        Err(e) => (ResultStatus::Failure, Value::Null, vec![e], vec![], None, None),
    };

    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;

    let result = TaskResult {
        task_id,
        workflow_id,
        agent_id: config.agent_id.clone(),
        status,
        output,
        errors,
        artifacts,
        metrics: ResultMetrics {
            duration_ms,
            ..Default::default()
        },
        next_stage,
        next_stage_payload,
        started_at: Some(started_at),
        completed_at,
    };

    let payload = match serde_json::to_value(&result) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, %task_id, "failed to serialize task result");
            return;
        }
    };

    let envelope = create_envelope("task.result", payload, Some(workflow_id), None, Some(config.agent_id.clone()));
    if let Err(e) = bus
        .publish(&config.result_topic, envelope, PublishOptions { durable: true })
        .await
    {
        error!(error = %e, %task_id, "failed to publish task result");
    }

    if exhausted_retries {
        let dlq_payload = serde_json::json!({
            "id": task_id,
            "last_error": result.errors.last(),
        });
        let dlq_envelope = create_envelope(
            "system.dead_letter",
            dlq_payload,
            Some(workflow_id),
            None,
            Some(config.agent_id.clone()),
        );
        if let Err(e) = bus.publish("dlq:failed", dlq_envelope, PublishOptions { durable: true }).await {
            error!(error = %e, %task_id, "failed to publish to dead letter queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_bus::InMemoryMessageBus;
    use flowforge_kv::InMemoryKvStore;
    use flowforge_schemas::agent_envelope::{Priority, TaskStatus, WorkflowContext};
    use serde_json::json;

    fn sample_task() -> AgentEnvelope {
        AgentEnvelope {
            task_id: uuid::Uuid::now_v7(),
            workflow_id: uuid::Uuid::now_v7(),
            agent_type: "scaffold".to_string(),
            priority: Priority::Medium,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 2,
            timeout_ms: 5_000,
            workflow_context: WorkflowContext {
                workflow_type: "app".to_string(),
                workflow_name: "demo".to_string(),
                current_stage: "scaffolding".to_string(),
                previous_stage: None,
                stage_outputs: None,
            },
            trace_id: None,
            parent_task_id: None,
            envelope_version: 1,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn successful_task_publishes_a_success_result() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let config = AgentRuntimeConfig::new("scaffold").with_agent_id("scaffold-test");
        let runtime = AgentRuntime::new(config.clone(), Arc::clone(&bus), kv, |_task| async {
            Ok(ExecutionOutcome::success(json!({"ok": true})))
        });

        let mut results = bus
            .subscribe(&config.result_topic, SubscribeOptions::default())
            .await
            .unwrap();

        runtime.start().await.unwrap();

        let envelope = create_envelope(
            "agent.scaffold.task",
            serde_json::to_value(&sample_task()).unwrap(),
            None,
            None,
            None,
        );
        bus.publish(&config.task_topic, envelope, PublishOptions::default())
            .await
            .unwrap();

        let result_envelope = tokio::time::timeout(Duration::from_secs(1), results.next())
            .await
            .expect("timed out waiting for result")
            .unwrap()
            .unwrap();
        let result: TaskResult = serde_json::from_value(result_envelope.payload).unwrap();
        assert!(result.is_success());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failing_handler_exhausts_retries_and_reports_failure() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let config = AgentRuntimeConfig::new("scaffold")
            .with_agent_id("scaffold-test-2")
            .with_retry_policy(RetryPolicy::standard().with_max_attempts(2).with_initial_interval(Duration::from_millis(1)))
            .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(100));
        let runtime = AgentRuntime::new(config.clone(), Arc::clone(&bus), kv, |_task| async {
            Err("boom".to_string())
        });

        let mut results = bus
            .subscribe(&config.result_topic, SubscribeOptions::default())
            .await
            .unwrap();

        runtime.start().await.unwrap();

        let envelope = create_envelope(
            "agent.scaffold.task",
            serde_json::to_value(&sample_task()).unwrap(),
            None,
            None,
            None,
        );
        bus.publish(&config.task_topic, envelope, PublishOptions::default())
            .await
            .unwrap();

        let result_envelope = tokio::time::timeout(Duration::from_secs(1), results.next())
            .await
            .expect("timed out waiting for result")
            .unwrap()
            .unwrap();
        let result: TaskResult = serde_json::from_value(result_envelope.payload).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.errors, vec!["boom".to_string()]);

        runtime.shutdown().await.unwrap();
    }

    /// S6: 5 consecutive model-API failures open the breaker; the
    /// remaining retry attempts for the same task fail fast with
    /// `CIRCUIT_OPEN` instead of invoking the handler again.
    #[tokio::test]
    async fn circuit_breaker_fast_fails_after_consecutive_failure_threshold() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let calls = Arc::new(AtomicU32::new(0));
        let call_count = Arc::clone(&calls);

        let config = AgentRuntimeConfig::new("scaffold")
            .with_agent_id("scaffold-test-breaker")
            .with_retry_policy(
                RetryPolicy::standard()
                    .with_max_attempts(10)
                    .with_initial_interval(Duration::from_millis(1)),
            )
            .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(5));
        let runtime = AgentRuntime::new(config.clone(), Arc::clone(&bus), kv, move |_task| {
            let call_count = Arc::clone(&call_count);
            async move {
                call_count.fetch_add(1, Ordering::SeqCst);
                Err("model api unreachable".to_string())
            }
        });

        let mut results = bus
            .subscribe(&config.result_topic, SubscribeOptions::default())
            .await
            .unwrap();

        runtime.start().await.unwrap();

        let envelope = create_envelope(
            "agent.scaffold.task",
            serde_json::to_value(&sample_task()).unwrap(),
            None,
            None,
            None,
        );
        bus.publish(&config.task_topic, envelope, PublishOptions::default())
            .await
            .unwrap();

        let result_envelope = tokio::time::timeout(Duration::from_secs(2), results.next())
            .await
            .expect("timed out waiting for result")
            .unwrap()
            .unwrap();
        let result: TaskResult = serde_json::from_value(result_envelope.payload).unwrap();

        assert!(!result.is_success());
        assert_eq!(result.errors, vec!["CIRCUIT_OPEN".to_string()]);
        // Only the first 5 attempts reached the handler; the rest fast-failed.
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        runtime.shutdown().await.unwrap();
    }
}
