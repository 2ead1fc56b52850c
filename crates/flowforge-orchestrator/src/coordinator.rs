//! Phase coordinators: one per phase (plan, code, certify, deploy, monitor),
//! each consuming `phase.<name>.request` and emitting `phase.<name>.result`
//! or `phase.<name>.error` (spec.md §4 component 8, §6). Gated individually
//! by [`crate::config::CoordinatorToggles`] so an operator can split phases
//! across processes.
//!
//! A coordinator does not implement phase-internal domain logic itself (the
//! actual planning/coding/certifying/deploying/monitoring work is an agent's
//! job); it validates the request envelope, forwards it to the owning
//! workflow via [`WorkflowEngine::apply_task_result`]-shaped reporting, and
//! republishes the outcome on the phase's own result/error topic so anything
//! subscribed to `phase.<name>.*` observes it without reaching into
//! `orchestrator:results`.

use std::sync::Arc;

use flowforge_core::bus::{MessageBus, PublishOptions, SubscribeOptions};
use flowforge_schemas::envelope::create_envelope;
use flowforge_schemas::task_result::TaskResult;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::engine::WorkflowEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Code,
    Certify,
    Deploy,
    Monitor,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Certify => "certify",
            Self::Deploy => "deploy",
            Self::Monitor => "monitor",
        }
    }

    fn request_topic(self) -> String {
        format!("phase.{}.request", self.name())
    }

    fn result_topic(self) -> String {
        format!("phase.{}.result", self.name())
    }

    fn error_topic(self) -> String {
        format!("phase.{}.error", self.name())
    }
}

pub struct PhaseCoordinator {
    phase: Phase,
    bus: Arc<dyn MessageBus>,
    engine: Arc<WorkflowEngine>,
    shutdown_tx: watch::Sender<bool>,
}

impl PhaseCoordinator {
    pub fn new(phase: Phase, bus: Arc<dyn MessageBus>, engine: Arc<WorkflowEngine>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            phase,
            bus,
            engine,
            shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the subscribe loop until [`shutdown`](Self::shutdown) is called
    /// or the bus subscription ends.
    #[instrument(skip(self), fields(phase = self.phase.name()))]
    pub async fn run(&self) -> flowforge_core::error::Result<()> {
        let mut requests = self
            .bus
            .subscribe(&self.phase.request_topic(), SubscribeOptions::default())
            .await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(phase = self.phase.name(), "phase coordinator listening");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(phase = self.phase.name(), "phase coordinator shutting down");
                        return Ok(());
                    }
                }
                next = requests.next() => {
                    match next {
                        Some(Ok(envelope)) => self.handle(envelope).await,
                        Some(Err(e)) => error!(phase = self.phase.name(), error = %e, "subscription error"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle(&self, envelope: flowforge_schemas::Envelope) {
        let result: TaskResult = match serde_json::from_value(envelope.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(phase = self.phase.name(), error = %e, "malformed phase request, dropping");
                self.publish_error(envelope.corr_id, format!("malformed phase request: {e}")).await;
                return;
            }
        };

        let outcome_payload = serde_json::json!({
            "task_id": result.task_id,
            "workflow_id": result.workflow_id,
            "status": result.status,
        });

        if let Err(e) = self.engine.apply_task_result(result).await {
            error!(phase = self.phase.name(), error = %e, "failed to apply phase result to workflow");
            self.publish_error(envelope.corr_id, e.to_string()).await;
            return;
        }

        let out = create_envelope(
            format!("phase.{}.result", self.phase.name()),
            outcome_payload,
            envelope.corr_id,
            envelope.tenant_id,
            envelope.source,
        );
        if let Err(e) = self.bus.publish(&self.phase.result_topic(), out, PublishOptions::default()).await {
            error!(phase = self.phase.name(), error = %e, "failed to publish phase result");
        }
    }

    async fn publish_error(&self, corr_id: Option<uuid::Uuid>, reason: String) {
        let payload = serde_json::json!({ "reason": reason });
        let envelope = create_envelope(format!("phase.{}.error", self.phase.name()), payload, corr_id, None, None);
        if let Err(e) = self.bus.publish(&self.phase.error_topic(), envelope, PublishOptions::default()).await {
            error!(phase = self.phase.name(), error = %e, "failed to publish phase error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_bus::InMemoryMessageBus;
    use flowforge_kv::InMemoryKvStore;
    use flowforge_schemas::agent_envelope::Priority;
    use flowforge_schemas::task_result::{ResultMetrics, ResultStatus};
    use flowforge_schemas::workflow::workflow_types;

    #[tokio::test]
    async fn malformed_request_emits_phase_error() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let kv: Arc<dyn flowforge_core::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let engine = Arc::new(WorkflowEngine::new("test", Arc::clone(&bus), kv));
        let coordinator = PhaseCoordinator::new(Phase::Plan, Arc::clone(&bus), engine);

        let mut errors = bus.subscribe("phase.plan.error", SubscribeOptions::default()).await.unwrap();
        let handle = tokio::spawn(async move { coordinator.run().await });

        let bad = create_envelope("phase.plan.request", serde_json::json!({"not": "a task result"}), None, None, None);
        bus.publish("phase.plan.request", bad, PublishOptions::default()).await.unwrap();

        let err = tokio::time::timeout(std::time::Duration::from_secs(1), errors.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(err.r#type, "phase.plan.error");
        handle.abort();
    }

    #[tokio::test]
    async fn valid_request_forwards_to_engine_and_emits_result() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let kv: Arc<dyn flowforge_core::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let engine = Arc::new(WorkflowEngine::new("test", Arc::clone(&bus), kv));

        let workflow_id = engine
            .create_workflow(workflow_types::APP, None, Priority::Medium)
            .await
            .unwrap();
        let workflow = engine.get_workflow(workflow_id).await.unwrap();

        let coordinator = PhaseCoordinator::new(Phase::Plan, Arc::clone(&bus), Arc::clone(&engine));
        let mut results = bus.subscribe("phase.plan.result", SubscribeOptions::default()).await.unwrap();
        let handle = tokio::spawn(async move { coordinator.run().await });

        let result = TaskResult {
            task_id: workflow.dispatched_task_id.unwrap(),
            workflow_id,
            agent_id: "plan-agent".to_string(),
            status: ResultStatus::Success,
            output: serde_json::json!({}),
            errors: vec![],
            artifacts: vec![],
            metrics: ResultMetrics::default(),
            next_stage: None,
            next_stage_payload: None,
            started_at: None,
            completed_at: chrono::Utc::now(),
        };
        let envelope = create_envelope("phase.plan.request", serde_json::to_value(&result).unwrap(), None, None, None);
        bus.publish("phase.plan.request", envelope, PublishOptions::default()).await.unwrap();

        let out = tokio::time::timeout(std::time::Duration::from_secs(1), results.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(out.r#type, "phase.plan.result");
        handle.abort();
    }
}
