//! Team coordination: the supervisor, delegation parsing, and the tools
//! agents use to talk to each other.

pub mod delegation;
pub mod protocol;
pub mod supervisor;
pub mod tools;

pub use delegation::{DelegationScanner, MarkerExtractor};
pub use protocol::{ToolError, ToolRequest, ToolResponse, ToolServer};
pub use supervisor::{MemberStatus, TeamStatusReport, TeamSupervisor, TEAM_STARTED, TEAM_STOPPED};
pub use tools::{
    CoordinationTool, ToolContext, ToolDefinition, ToolRegistry, DIRECT_MESSAGE, HELP_REQUESTED,
    TASK_COMPLETED,
};
