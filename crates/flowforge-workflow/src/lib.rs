//! Workflow definition resolution, the state machine driving a single
//! workflow's status, and the state manager that persists it through a
//! [`flowforge_core::kv::KvStore`].

pub mod resolver;
pub mod state_machine;
pub mod state_manager;

pub use resolver::{ResolvedDefinition, WorkflowDefinitionResolver};
pub use state_machine::{apply, complete, TransitionError, WorkflowTransition};
pub use state_manager::WorkflowStateManager;
