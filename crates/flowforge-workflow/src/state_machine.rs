//! The workflow state machine: `initiated -> running -> (stage_running <->
//! stage_succeeded)* -> succeeded|failed|cancelled`, with `paused` as a
//! side-state reachable from `running` (spec.md §4.6).

use flowforge_schemas::workflow::{Workflow, WorkflowStatus};
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum WorkflowTransition {
    Start,
    StageCompleted { stage: String, progress: u8, output: Value },
    StageFailed { stage: String, error: String },
    Pause,
    Resume,
    Cancel,
    Timeout { stage: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot apply {transition} while workflow is {status:?}")]
    InvalidForState {
        transition: &'static str,
        status: WorkflowStatus,
    },
}

impl WorkflowTransition {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageFailed { .. } => "stage_failed",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Apply `transition` to `workflow` in place. Rejects transitions that are
/// not valid for the workflow's current status; terminal states accept
/// nothing further except what is already a no-op (none are).
pub fn apply(workflow: &mut Workflow, transition: WorkflowTransition) -> Result<(), TransitionError> {
    use WorkflowStatus::*;

    let invalid = || TransitionError::InvalidForState {
        transition: transition.name(),
        status: workflow.status,
    };

    match &transition {
        WorkflowTransition::Start => {
            if workflow.status != Initiated {
                return Err(invalid());
            }
            workflow.status = Running;
        }
        WorkflowTransition::StageCompleted { stage, progress, output } => {
            if workflow.status != Running {
                return Err(invalid());
            }
            workflow.previous_stage = Some(std::mem::replace(&mut workflow.current_stage, stage.clone()));
            workflow.advance_progress(*progress, false);
            workflow.stage_outputs.insert(stage.clone(), output.clone());
        }
        WorkflowTransition::StageFailed { error, .. } => {
            if workflow.status != Running {
                return Err(invalid());
            }
            workflow
                .stage_outputs
                .insert("__last_error".to_string(), Value::String(error.clone()));
            workflow.finish(Failed);
        }
        WorkflowTransition::Pause => {
            if workflow.status != Running {
                return Err(invalid());
            }
            workflow.status = Paused;
        }
        WorkflowTransition::Resume => {
            if workflow.status != Paused {
                return Err(invalid());
            }
            workflow.status = Running;
        }
        WorkflowTransition::Cancel => {
            if workflow.status.is_terminal() {
                return Err(invalid());
            }
            workflow.finish(Cancelled);
        }
        WorkflowTransition::Timeout { .. } => {
            if workflow.status != Running && workflow.status != Paused {
                return Err(invalid());
            }
            workflow
                .stage_outputs
                .insert("__last_error".to_string(), Value::String("STAGE_TIMEOUT".to_string()));
            workflow.finish(Failed);
        }
    }

    workflow.version += 1;
    Ok(())
}

/// Reached `WorkflowStatus::Succeeded` directly, bypassing the per-stage
/// transition above (used when the final stage's `on_success` is `End`).
pub fn complete(workflow: &mut Workflow) -> Result<(), TransitionError> {
    if workflow.status != WorkflowStatus::Running {
        return Err(TransitionError::InvalidForState {
            transition: "complete",
            status: workflow.status,
        });
    }
    workflow.finish(WorkflowStatus::Succeeded);
    workflow.advance_progress(100, false);
    workflow.version += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_schemas::agent_envelope::Priority;
    use flowforge_schemas::workflow::workflow_types;
    use serde_json::json;

    fn fresh_workflow() -> Workflow {
        Workflow::new(workflow_types::APP, None, Priority::Medium)
    }

    #[test]
    fn start_moves_initiated_to_running() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.version, 1);
    }

    #[test]
    fn cannot_start_twice() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        assert!(apply(&mut wf, WorkflowTransition::Start).is_err());
    }

    #[test]
    fn stage_completed_advances_progress_and_records_output() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        apply(
            &mut wf,
            WorkflowTransition::StageCompleted {
                stage: "scaffolding".to_string(),
                progress: 20,
                output: json!({"files": 3}),
            },
        )
        .unwrap();
        assert_eq!(wf.current_stage, "scaffolding");
        assert_eq!(wf.progress, 20);
        assert_eq!(wf.stage_outputs["scaffolding"], json!({"files": 3}));
    }

    #[test]
    fn stage_failed_terminates_workflow() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        apply(
            &mut wf,
            WorkflowTransition::StageFailed {
                stage: "validation".to_string(),
                error: "timeout".to_string(),
            },
        )
        .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert!(wf.completed_at.is_some());
    }

    #[test]
    fn timeout_terminates_workflow_and_records_last_error() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        apply(&mut wf, WorkflowTransition::Timeout { stage: "deployment".to_string() }).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.stage_outputs["__last_error"], json!("STAGE_TIMEOUT"));
    }

    #[test]
    fn pause_then_resume_round_trips() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        apply(&mut wf, WorkflowTransition::Pause).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Paused);
        apply(&mut wf, WorkflowTransition::Resume).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Running);
    }

    #[test]
    fn cancel_is_rejected_once_terminal() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        apply(&mut wf, WorkflowTransition::Cancel).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert!(apply(&mut wf, WorkflowTransition::Cancel).is_err());
    }

    #[test]
    fn complete_requires_running_and_sets_full_progress() {
        let mut wf = fresh_workflow();
        apply(&mut wf, WorkflowTransition::Start).unwrap();
        complete(&mut wf).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Succeeded);
        assert_eq!(wf.progress, 100);
    }
}
