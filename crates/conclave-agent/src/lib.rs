pub mod backends;
pub mod bootstrap;
pub mod handles;
pub mod launcher;
pub mod logs;
pub mod normalize;
pub mod run_log;
pub mod team;
pub mod triggers;
pub mod workflow;

pub use backends::BackendRegistry;
pub use bootstrap::{Conclave, ExecutionLease};
pub use handles::InMemoryHandles;
pub use launcher::{AgentLauncher, LaunchOptions, LaunchOutcome, LaunchedRun, INTERRUPTED};
pub use logs::InMemoryLogBuffer;
pub use run_log::RunLogger;
pub use team::{
    MarkerExtractor, TeamStatusReport, TeamSupervisor, ToolRegistry, ToolRequest, ToolResponse,
    ToolServer,
};
pub use triggers::{next_cron_fire, run_webhook, validate_trigger, WorkflowScheduler};
pub use workflow::{WorkflowEngine, STEP_TIMED_OUT};
