//! State-manager entities: point-in-time snapshots, recovery checkpoints,
//! and the distributed lock token used to serialize writes to one workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{Workflow, WorkflowStatus};

/// A full point-in-time copy of a [`Workflow`], stored keyed by
/// `workflow:{id}:snapshot` (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub workflow_id: Uuid,
    pub workflow: Workflow,
    pub taken_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn of(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id,
            workflow: workflow.clone(),
            taken_at: Utc::now(),
        }
    }
}

/// A smaller, append-only marker written after every stage transition so a
/// crashed orchestrator can resume from the last known-good stage without
/// replaying the full snapshot history (spec.md §4.5 recovery path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCheckpoint {
    pub workflow_id: Uuid,
    pub stage: String,
    pub status: WorkflowStatus,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_output: Option<Value>,
}

impl RecoveryCheckpoint {
    pub fn new(workflow_id: Uuid, stage: impl Into<String>, status: WorkflowStatus) -> Self {
        Self {
            workflow_id,
            stage: stage.into(),
            status,
            recorded_at: Utc::now(),
            stage_output: None,
        }
    }
}

/// A cooperative, TTL-bounded mutual exclusion token over one workflow's
/// mutable state. Not Lamport-ordered: holders are trusted to release (or
/// let the TTL expire) rather than being fenced by a monotonic epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowLock {
    pub workflow_id: Uuid,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WorkflowLock {
    pub fn new(workflow_id: Uuid, holder: impl Into<String>, ttl_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            workflow_id,
            holder: holder.into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_envelope::Priority;
    use crate::workflow::workflow_types;

    #[test]
    fn snapshot_captures_workflow_by_value() {
        let wf = Workflow::new(workflow_types::APP, None, Priority::Medium);
        let snap = StateSnapshot::of(&wf);
        assert_eq!(snap.workflow_id, wf.id);
        assert_eq!(snap.workflow, wf);
    }

    #[test]
    fn checkpoint_defaults_to_no_stage_output() {
        let cp = RecoveryCheckpoint::new(Uuid::now_v7(), "scaffolding", WorkflowStatus::Running);
        assert!(cp.stage_output.is_none());
    }

    #[test]
    fn lock_expiry_boundary() {
        let lock = WorkflowLock::new(Uuid::now_v7(), "orchestrator-1", 1000);
        assert!(!lock.is_expired(lock.acquired_at));
        assert!(lock.is_expired(lock.expires_at));
    }
}
