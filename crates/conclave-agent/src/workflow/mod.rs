//! Workflow execution: dependency layers, conditions, templated prompts,
//! retries and timeouts.

pub mod blackboard;
pub mod condition;
pub mod engine;
pub mod layers;
pub mod template;

pub use blackboard::RunBlackboard;
pub use condition::{evaluate_condition, Condition, ConditionError};
pub use engine::{validate_steps, WorkflowEngine, STEP_TIMED_OUT};
pub use layers::resolve_layers;
pub use template::interpolate;
