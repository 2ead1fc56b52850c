pub mod config;
pub mod coordinator;
pub mod engine;

pub use config::{Config, ConfigError, CoordinatorToggles};
pub use coordinator::{Phase, PhaseCoordinator};
pub use engine::{EngineError, WorkflowEngine};
