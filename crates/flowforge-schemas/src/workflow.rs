//! Workflow entity and the per-platform stage-graph definition it is routed by.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent_envelope::Priority;

/// Built-in workflow types with fallback stage sequences (spec.md §4.7).
/// `Custom` covers any other string a platform wants to route via its own
/// [`WorkflowDefinition`].
pub mod workflow_types {
    pub const APP: &str = "app";
    pub const SERVICE: &str = "service";
    pub const FEATURE: &str = "feature";
    pub const CAPABILITY: &str = "capability";
    pub const BUGFIX: &str = "bugfix";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initiated,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One invocation of a stage graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    pub status: WorkflowStatus,
    pub current_stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_stage: Option<String>,
    pub progress: u8,
    pub priority: Priority,
    #[serde(default)]
    pub stage_outputs: HashMap<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// `task_id` of the outstanding dispatch for `current_stage`, if any
    /// (spec.md §4.8 dispatch rule: at most one per stage slot).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_task_id: Option<Uuid>,
    /// Retry attempts already made for `current_stage`, reset on advance.
    #[serde(default)]
    pub stage_retry_count: u32,
    /// Compare-and-swap token; every mutation is a CAS on this field.
    pub version: u64,
}

impl Workflow {
    pub fn new(r#type: impl Into<String>, platform_id: Option<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::now_v7(),
            r#type: r#type.into(),
            platform_id,
            status: WorkflowStatus::Initiated,
            current_stage: String::new(),
            previous_stage: None,
            progress: 0,
            priority,
            stage_outputs: HashMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            dispatched_task_id: None,
            stage_retry_count: 0,
            version: 0,
        }
    }

    /// Enforce monotone progress (spec.md §3 invariant, §8 property 2)
    /// unless `allow_rollback` is set.
    pub fn advance_progress(&mut self, new_progress: u8, allow_rollback: bool) {
        if allow_rollback || new_progress >= self.progress {
            self.progress = new_progress.min(100);
        }
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

/// What a stage does when its task succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnSuccess {
    Stage { name: String },
    End,
}

/// What a stage does when its task fails and its retry budget is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OnFailure {
    Stage { name: String },
    End,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub agent_type: String,
    pub timeout_ms: u64,
    pub retry_strategy: RetryStrategy,
    pub on_success: OnSuccess,
    pub on_failure: OnFailure,
    /// Progress weight; the sum along any success path must be <= 100.
    pub weight: u32,
}

/// A platform-scoped, customer-defined stage graph (spec.md §3, §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub platform_id: String,
    pub workflow_type: String,
    pub enabled: bool,
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("stage graph contains a cycle")]
    Cycle,

    #[error("stage {0:?} is unreachable from any entry point")]
    Unreachable(String),

    #[error("stage {0:?} has no stages and is not a valid entry point")]
    Empty(String),

    #[error("on_success of stage {0:?} targets nonexistent stage {1:?}")]
    DanglingOnSuccess(String, String),

    #[error("on_failure of stage {0:?} targets nonexistent stage {1:?}")]
    DanglingOnFailure(String, String),

    #[error("success-path weight sum exceeds 100 (got {0})")]
    WeightOverflow(u32),

    #[error("no stage reaches END on its success path")]
    NoSink,
}

impl WorkflowDefinition {
    /// Validate the stage graph per spec.md §3/§8 property 8: must be a
    /// finite DAG, every `on_success`/`on_failure` target must exist (or be
    /// END/skip), and success-path weight sums must not exceed 100.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.stages.is_empty() {
            return Err(DefinitionError::Empty(self.workflow_type.clone()));
        }

        let names: HashSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();

        for stage in &self.stages {
            if let OnSuccess::Stage { name } = &stage.on_success {
                if !names.contains(name.as_str()) {
                    return Err(DefinitionError::DanglingOnSuccess(
                        stage.name.clone(),
                        name.clone(),
                    ));
                }
            }
            if let OnFailure::Stage { name } = &stage.on_failure {
                if !names.contains(name.as_str()) {
                    return Err(DefinitionError::DanglingOnFailure(
                        stage.name.clone(),
                        name.clone(),
                    ));
                }
            }
        }

        self.check_acyclic()?;
        self.check_reachable()?;
        self.check_weight_budget()?;

        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        // DFS over the on_success edges (the graph that defines progression);
        // on_failure edges to earlier stages are allowed (e.g. retries loop
        // back to the same stage via the executor, not via the graph).
        let mut visiting: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();

        fn visit<'a>(
            stage: &'a str,
            by_name: &HashMap<&'a str, &'a StageDefinition>,
            visiting: &mut HashSet<&'a str>,
            visited: &mut HashSet<&'a str>,
        ) -> Result<(), DefinitionError> {
            if visited.contains(stage) {
                return Ok(());
            }
            if visiting.contains(stage) {
                return Err(DefinitionError::Cycle);
            }
            visiting.insert(stage);
            if let Some(def) = by_name.get(stage) {
                if let OnSuccess::Stage { name } = &def.on_success {
                    visit(name, by_name, visiting, visited)?;
                }
            }
            visiting.remove(stage);
            visited.insert(stage);
            Ok(())
        }

        let by_name: HashMap<&str, &StageDefinition> =
            self.stages.iter().map(|s| (s.name.as_str(), s)).collect();

        for stage in &self.stages {
            visit(&stage.name, &by_name, &mut visiting, &mut visited)?;
        }
        Ok(())
    }

    fn check_reachable(&self) -> Result<(), DefinitionError> {
        // Every stage must reach END along its on_success chain.
        let by_name: HashMap<&str, &StageDefinition> =
            self.stages.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut any_sink = false;
        for stage in &self.stages {
            let mut cur = stage;
            let mut seen = HashSet::new();
            loop {
                match &cur.on_success {
                    OnSuccess::End => {
                        any_sink = true;
                        break;
                    }
                    OnSuccess::Stage { name } => {
                        if !seen.insert(name.clone()) {
                            return Err(DefinitionError::Unreachable(stage.name.clone()));
                        }
                        cur = match by_name.get(name.as_str()) {
                            Some(next) => next,
                            None => return Err(DefinitionError::Unreachable(stage.name.clone())),
                        };
                    }
                }
            }
        }
        if !any_sink {
            return Err(DefinitionError::NoSink);
        }
        Ok(())
    }

    fn check_weight_budget(&self) -> Result<(), DefinitionError> {
        let by_name: HashMap<&str, &StageDefinition> =
            self.stages.iter().map(|s| (s.name.as_str(), s)).collect();

        // Longest success-path weight sum starting from each stage.
        for start in &self.stages {
            let mut total: u32 = 0;
            let mut cur = start;
            let mut steps = VecDeque::new();
            loop {
                total = total.saturating_add(cur.weight);
                steps.push_back(cur.name.clone());
                match &cur.on_success {
                    OnSuccess::End => break,
                    OnSuccess::Stage { name } => {
                        cur = by_name
                            .get(name.as_str())
                            .expect("dangling targets rejected earlier");
                    }
                }
                if steps.len() > self.stages.len() + 1 {
                    break; // cycle already rejected by check_acyclic
                }
            }
            if total > 100 {
                return Err(DefinitionError::WeightOverflow(total));
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, on_success: OnSuccess, weight: u32) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            agent_type: "data-validation".to_string(),
            timeout_ms: 30_000,
            retry_strategy: RetryStrategy::default(),
            on_success,
            on_failure: OnFailure::End,
            weight,
        }
    }

    fn three_stage_ml_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            platform_id: "ml-platform".to_string(),
            workflow_type: "custom-ml".to_string(),
            enabled: true,
            stages: vec![
                stage(
                    "data-preparation",
                    OnSuccess::Stage {
                        name: "model-training".to_string(),
                    },
                    30,
                ),
                stage(
                    "model-training",
                    OnSuccess::Stage {
                        name: "model-evaluation".to_string(),
                    },
                    50,
                ),
                stage("model-evaluation", OnSuccess::End, 20),
            ],
        }
    }

    #[test]
    fn valid_three_stage_definition_passes() {
        assert!(three_stage_ml_definition().validate().is_ok());
    }

    #[test]
    fn rejects_cycles() {
        let mut def = three_stage_ml_definition();
        def.stages[2].on_success = OnSuccess::Stage {
            name: "data-preparation".to_string(),
        };
        assert_eq!(def.validate(), Err(DefinitionError::Cycle));
    }

    #[test]
    fn rejects_dangling_on_success_target() {
        let mut def = three_stage_ml_definition();
        def.stages[1].on_success = OnSuccess::Stage {
            name: "does-not-exist".to_string(),
        };
        assert!(matches!(def.validate(), Err(DefinitionError::DanglingOnSuccess(_, _))));
    }

    #[test]
    fn rejects_weight_overflow() {
        let mut def = three_stage_ml_definition();
        def.stages[1].weight = 90;
        assert!(matches!(def.validate(), Err(DefinitionError::WeightOverflow(_))));
    }

    #[test]
    fn workflow_progress_is_monotone_unless_rollback_allowed() {
        let mut wf = Workflow::new(workflow_types::APP, None, Priority::Medium);
        wf.advance_progress(30, false);
        wf.advance_progress(10, false);
        assert_eq!(wf.progress, 30);

        wf.advance_progress(10, true);
        assert_eq!(wf.progress, 10);
    }

    #[test]
    fn finish_sets_completed_at() {
        let mut wf = Workflow::new(workflow_types::APP, None, Priority::Medium);
        assert!(wf.completed_at.is_none());
        wf.finish(WorkflowStatus::Succeeded);
        assert!(wf.completed_at.is_some());
    }
}
