//! Workflow engine: the programmatic surface (spec.md §6) that drives a
//! workflow through its stage graph by combining the resolver, state
//! machine, and state manager with the bus.

use std::sync::Arc;

use chrono::Utc;
use flowforge_core::bus::{MessageBus, PublishOptions};
use flowforge_core::idempotency::deduplicate;
use flowforge_core::kv::KvStore;
use flowforge_schemas::agent_envelope::{AgentEnvelope, Priority, TaskStatus, WorkflowContext};
use flowforge_schemas::envelope::create_envelope;
use flowforge_schemas::task_result::{ResultStatus, TaskResult};
use flowforge_schemas::workflow::{OnFailure, OnSuccess, StageDefinition, Workflow, WorkflowDefinition, WorkflowStatus};
use flowforge_workflow::state_machine::{self, WorkflowTransition};
use flowforge_workflow::{ResolvedDefinition, WorkflowDefinitionResolver, WorkflowStateManager};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const DEDUP_TTL: std::time::Duration = std::time::Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    NotFound(Uuid),

    #[error("stage {0:?} has no definition in the resolved workflow")]
    UnknownStage(String),

    #[error(transparent)]
    Core(#[from] flowforge_core::error::CoreError),

    #[error(transparent)]
    Transition(#[from] state_machine::TransitionError),
}

pub struct WorkflowEngine {
    instance_id: String,
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KvStore>,
    resolver: WorkflowDefinitionResolver,
    state: WorkflowStateManager,
}

impl WorkflowEngine {
    pub fn new(instance_id: impl Into<String>, bus: Arc<dyn MessageBus>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            instance_id: instance_id.into(),
            bus,
            resolver: WorkflowDefinitionResolver::new(Arc::clone(&kv)),
            state: WorkflowStateManager::new(Arc::clone(&kv)),
            kv,
        }
    }

    pub fn resolver(&self) -> &WorkflowDefinitionResolver {
        &self.resolver
    }

    /// Create a workflow and dispatch its first stage.
    #[instrument(skip(self), fields(workflow_type = %workflow_type))]
    pub async fn create_workflow(
        &self,
        workflow_type: &str,
        platform_id: Option<String>,
        priority: Priority,
    ) -> Result<Uuid, EngineError> {
        let mut workflow = Workflow::new(workflow_type, platform_id.clone(), priority);
        let workflow_id = workflow.id;

        let resolved = self
            .resolver
            .resolve(platform_id.as_deref().unwrap_or("default"), workflow_type)
            .await?;
        let first = resolved
            .definition
            .stages
            .first()
            .ok_or_else(|| EngineError::UnknownStage("<empty definition>".to_string()))?
            .clone();

        state_machine::apply(&mut workflow, WorkflowTransition::Start)?;
        self.dispatch_stage(&mut workflow, &first).await?;
        self.state.save(&workflow).await?;
        self.emit_workflow_event(&workflow, "workflow.created").await;
        if resolved.is_fallback {
            self.emit_workflow_event(&workflow, "definition_gone").await;
        }

        info!(%workflow_id, %workflow_type, "workflow created");
        Ok(workflow_id)
    }

    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        self.state
            .load(workflow_id)
            .await?
            .ok_or(EngineError::NotFound(workflow_id))
    }

    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        self.mutate(workflow_id, WorkflowTransition::Cancel).await
    }

    #[instrument(skip(self))]
    pub async fn pause_workflow(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        self.mutate(workflow_id, WorkflowTransition::Pause).await
    }

    #[instrument(skip(self))]
    pub async fn resume_workflow(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        self.mutate(workflow_id, WorkflowTransition::Resume).await
    }

    /// Re-dispatch the current stage from scratch, resetting its retry
    /// count — used after an operator-triggered `retry_workflow` call on a
    /// failed workflow.
    #[instrument(skip(self))]
    pub async fn retry_workflow(&self, workflow_id: Uuid) -> Result<Workflow, EngineError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        let resolved = self.resolved_definition(&workflow).await?;
        let stage = resolved
            .definition
            .stage(&workflow.current_stage)
            .ok_or_else(|| EngineError::UnknownStage(workflow.current_stage.clone()))?
            .clone();

        workflow.status = WorkflowStatus::Running;
        workflow.completed_at = None;
        workflow.stage_retry_count = 0;
        self.dispatch_stage(&mut workflow, &stage).await?;
        self.state.save(&workflow).await?;
        Ok(workflow)
    }

    async fn mutate(&self, workflow_id: Uuid, transition: WorkflowTransition) -> Result<Workflow, EngineError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        state_machine::apply(&mut workflow, transition)?;
        self.state.save(&workflow).await?;
        Ok(workflow)
    }

    async fn resolved_definition(&self, workflow: &Workflow) -> Result<ResolvedDefinition, EngineError> {
        Ok(self
            .resolver
            .resolve(workflow.platform_id.as_deref().unwrap_or("default"), &workflow.r#type)
            .await?)
    }

    /// Apply an incoming [`TaskResult`] to the workflow it belongs to
    /// (spec.md §4.8 `STAGE_COMPLETED`/`STAGE_FAILED`). Deduplicates by
    /// `task_id` and discards late results for terminal or already-advanced
    /// stages, per spec.md §4.11.
    #[instrument(skip(self, result), fields(task_id = %result.task_id, workflow_id = %result.workflow_id))]
    pub async fn apply_task_result(&self, result: TaskResult) -> Result<(), EngineError> {
        if !deduplicate(self.kv.as_ref(), "task-result", result.task_id, DEDUP_TTL).await? {
            debug!(task_id = %result.task_id, "duplicate task result ignored");
            self.emit_result_event(result.workflow_id, result.task_id, "workflow.result_duplicate_ignored").await;
            return Ok(());
        }

        let mut workflow = match self.state.load(result.workflow_id).await? {
            Some(w) => w,
            None => {
                warn!(workflow_id = %result.workflow_id, "result for unknown workflow, discarding");
                return Ok(());
            }
        };

        if workflow.status.is_terminal() {
            debug!(workflow_id = %workflow.id, "late result for terminal workflow, discarding");
            self.emit_result_event(workflow.id, result.task_id, "workflow.result_late_discarded").await;
            return Ok(());
        }

        if workflow.dispatched_task_id != Some(result.task_id) {
            debug!(workflow_id = %workflow.id, "result does not match outstanding dispatch, discarding");
            self.emit_result_event(workflow.id, result.task_id, "workflow.result_late_discarded").await;
            return Ok(());
        }

        let resolved = self.resolved_definition(&workflow).await?;
        let definition = &resolved.definition;
        let stage = definition
            .stage(&workflow.current_stage)
            .ok_or_else(|| EngineError::UnknownStage(workflow.current_stage.clone()))?
            .clone();

        if result.is_success() {
            self.on_stage_succeeded(&mut workflow, definition, &stage, resolved.is_fallback, result).await?;
        } else {
            let error = result.errors.into_iter().next().unwrap_or_default();
            self.on_stage_failed(&mut workflow, definition, &stage, resolved.is_fallback, error, false).await?;
        }

        self.state.save(&workflow).await?;
        Ok(())
    }

    /// Applied when the dispatch deadline for `task_id` expires before any
    /// result arrives. A no-op if the workflow has already moved past this
    /// dispatch (a late result raced the deadline, or it was cancelled).
    #[instrument(skip(self))]
    async fn apply_dispatch_timeout(&self, workflow_id: Uuid, task_id: Uuid, stage_name: &str) -> Result<(), EngineError> {
        let mut workflow = match self.state.load(workflow_id).await? {
            Some(w) => w,
            None => return Ok(()),
        };
        if workflow.status.is_terminal() || workflow.dispatched_task_id != Some(task_id) {
            return Ok(());
        }

        let resolved = self.resolved_definition(&workflow).await?;
        let definition = &resolved.definition;
        let stage = definition
            .stage(stage_name)
            .ok_or_else(|| EngineError::UnknownStage(stage_name.to_string()))?
            .clone();

        warn!(%workflow_id, stage = stage_name, "stage dispatch deadline expired");
        self.on_stage_failed(&mut workflow, definition, &stage, resolved.is_fallback, "STAGE_TIMEOUT".to_string(), true)
            .await?;
        self.state.save(&workflow).await?;
        Ok(())
    }

    async fn on_stage_succeeded(
        &self,
        workflow: &mut Workflow,
        definition: &WorkflowDefinition,
        stage: &StageDefinition,
        is_fallback: bool,
        result: TaskResult,
    ) -> Result<(), EngineError> {
        let new_progress = progress_after(definition, &stage.name, is_fallback);

        match &stage.on_success {
            OnSuccess::End => {
                state_machine::apply(
                    workflow,
                    WorkflowTransition::StageCompleted {
                        stage: stage.name.clone(),
                        progress: new_progress,
                        output: result.output,
                    },
                )?;
                state_machine::complete(workflow)?;
                self.emit_workflow_event(workflow, "workflow.completed").await;
            }
            OnSuccess::Stage { name } => {
                state_machine::apply(
                    workflow,
                    WorkflowTransition::StageCompleted {
                        stage: stage.name.clone(),
                        progress: new_progress,
                        output: result.output,
                    },
                )?;
                let next = definition
                    .stage(name)
                    .ok_or_else(|| EngineError::UnknownStage(name.clone()))?
                    .clone();
                workflow.stage_retry_count = 0;
                self.dispatch_stage(workflow, &next).await?;
            }
        }
        Ok(())
    }

    async fn on_stage_failed(
        &self,
        workflow: &mut Workflow,
        definition: &WorkflowDefinition,
        stage: &StageDefinition,
        is_fallback: bool,
        error: String,
        is_timeout: bool,
    ) -> Result<(), EngineError> {
        if workflow.stage_retry_count < stage.retry_strategy.max_retries {
            workflow.stage_retry_count += 1;
            info!(
                workflow_id = %workflow.id,
                stage = %stage.name,
                attempt = workflow.stage_retry_count,
                "retrying failed stage"
            );
            self.dispatch_stage(workflow, stage).await?;
            return Ok(());
        }

        match &stage.on_failure {
            OnFailure::End => {
                if is_timeout {
                    state_machine::apply(workflow, WorkflowTransition::Timeout { stage: stage.name.clone() })?;
                } else {
                    state_machine::apply(
                        workflow,
                        WorkflowTransition::StageFailed { stage: stage.name.clone(), error },
                    )?;
                }
                self.emit_workflow_event(workflow, "workflow.failed").await;
            }
            OnFailure::Skip => {
                let new_progress = progress_after(definition, &stage.name, is_fallback);
                workflow
                    .stage_outputs
                    .insert(stage.name.clone(), serde_json::json!({"skipped": true}));
                state_machine::apply(
                    workflow,
                    WorkflowTransition::StageCompleted {
                        stage: stage.name.clone(),
                        progress: new_progress,
                        output: serde_json::Value::Null,
                    },
                )?;
                match &stage.on_success {
                    OnSuccess::End => state_machine::complete(workflow)?,
                    OnSuccess::Stage { name } => {
                        let next = definition
                            .stage(name)
                            .ok_or_else(|| EngineError::UnknownStage(name.clone()))?
                            .clone();
                        workflow.stage_retry_count = 0;
                        self.dispatch_stage(workflow, &next).await?;
                    }
                }
            }
            OnFailure::Stage { name } => {
                let next = definition
                    .stage(name)
                    .ok_or_else(|| EngineError::UnknownStage(name.clone()))?
                    .clone();
                workflow.stage_retry_count = 0;
                self.dispatch_stage(workflow, &next).await?;
            }
        }
        Ok(())
    }

    async fn dispatch_stage(&self, workflow: &mut Workflow, stage: &StageDefinition) -> Result<(), EngineError> {
        let task_id = Uuid::now_v7();
        workflow.previous_stage = if workflow.current_stage.is_empty() {
            None
        } else {
            Some(workflow.current_stage.clone())
        };
        workflow.current_stage = stage.name.clone();
        workflow.dispatched_task_id = Some(task_id);
        workflow.version += 1;

        let task = AgentEnvelope {
            task_id,
            workflow_id: workflow.id,
            agent_type: stage.agent_type.clone(),
            priority: workflow.priority,
            status: TaskStatus::Queued,
            retry_count: workflow.stage_retry_count,
            max_retries: stage.retry_strategy.max_retries,
            timeout_ms: stage.timeout_ms,
            workflow_context: WorkflowContext {
                workflow_type: workflow.r#type.clone(),
                workflow_name: workflow.id.to_string(),
                current_stage: stage.name.clone(),
                previous_stage: workflow.previous_stage.clone(),
                stage_outputs: serde_json::to_value(&workflow.stage_outputs).ok(),
            },
            trace_id: None,
            parent_task_id: None,
            envelope_version: 1,
            payload: serde_json::Value::Null,
        };

        let topic = format!("agent:{}:tasks", stage.agent_type);
        let payload = serde_json::to_value(&task).map_err(flowforge_core::error::CoreError::from)?;
        let envelope = create_envelope("agent.task.dispatched", payload, Some(workflow.id), None, Some(self.instance_id.clone()));
        self.bus.publish(&topic, envelope, PublishOptions { durable: true }).await?;

        debug!(workflow_id = %workflow.id, stage = %stage.name, %task_id, "dispatched stage");
        self.schedule_dispatch_timeout(workflow.id, task_id, stage.name.clone(), stage.timeout_ms);
        Ok(())
    }

    /// Spawn a deadline watcher for this dispatch: if no result has moved
    /// `workflow.dispatched_task_id` past `task_id` by the time `timeout_ms`
    /// elapses, synthesize a `STAGE_TIMEOUT` failure. Reconstructs a fresh
    /// [`WorkflowEngine`] rather than holding `self` across the sleep, since
    /// `resolver`/`state` are cheap `Arc` wrappers and this avoids needing
    /// `WorkflowEngine` itself to live behind an `Arc` for self-reference.
    fn schedule_dispatch_timeout(&self, workflow_id: Uuid, task_id: Uuid, stage_name: String, timeout_ms: u64) {
        let instance_id = self.instance_id.clone();
        let bus = Arc::clone(&self.bus);
        let kv = Arc::clone(&self.kv);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            let engine = WorkflowEngine::new(instance_id, bus, kv);
            if let Err(e) = engine.apply_dispatch_timeout(workflow_id, task_id, &stage_name).await {
                warn!(error = %e, %workflow_id, stage = %stage_name, "failed to apply dispatch timeout");
            }
        });
    }

    async fn emit_workflow_event(&self, workflow: &Workflow, event_type: &str) {
        let payload = serde_json::json!({
            "workflow_id": workflow.id,
            "status": workflow.status,
            "progress": workflow.progress,
        });
        let envelope = create_envelope(event_type, payload, Some(workflow.id), None, Some(self.instance_id.clone()));
        if let Err(e) = self.bus.publish("workflow:events", envelope, PublishOptions::default()).await {
            warn!(error = %e, workflow_id = %workflow.id, "failed to emit workflow event");
        }
    }

    /// Emits a lightweight `workflow:events` entry for a discarded/ignored
    /// task result, counted by the metrics aggregator but carrying no
    /// workflow snapshot (the duplicate-check path runs before the workflow
    /// is even loaded).
    async fn emit_result_event(&self, workflow_id: Uuid, task_id: Uuid, event_type: &str) {
        let payload = serde_json::json!({
            "workflow_id": workflow_id,
            "task_id": task_id,
        });
        let envelope = create_envelope(event_type, payload, Some(workflow_id), None, Some(self.instance_id.clone()));
        if let Err(e) = self.bus.publish("workflow:events", envelope, PublishOptions::default()).await {
            warn!(error = %e, %workflow_id, "failed to emit result event");
        }
    }
}

/// Progress after completing `stage_name`. Definition-driven workflows sum
/// weights along the `on_success` chain up to and including `stage_name`,
/// capped at 100; fallback (builtin, no platform override) workflows use
/// the flatter `min(100, (completed_index + 1) * 15)` rule instead, keyed
/// off position in `definition.stages` (the builtin sequences are declared
/// in execution order, unlike arbitrary platform overrides).
fn progress_after(definition: &WorkflowDefinition, stage_name: &str, is_fallback: bool) -> u8 {
    if is_fallback {
        return match definition.stages.iter().position(|s| s.name == stage_name) {
            Some(idx) => (((idx as u32 + 1) * 15).min(100)) as u8,
            None => 0,
        };
    }

    let mut total: u32 = 0;
    let mut cur = match definition.stages.first() {
        Some(s) => s,
        None => return 0,
    };
    loop {
        total = total.saturating_add(cur.weight);
        if cur.name == stage_name {
            break;
        }
        match &cur.on_success {
            OnSuccess::Stage { name } => match definition.stage(name) {
                Some(next) => cur = next,
                None => break,
            },
            OnSuccess::End => break,
        }
    }
    total.min(100) as u8
}
