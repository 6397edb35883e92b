use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConclaveError;

/// Team id used for blackboard entries that are not scoped to a team.
pub const GLOBAL_TEAM: &str = "_global";

/// Event type published when a supervisor hands a task to a teammate.
pub const TASK_DELEGATED: &str = "task.delegated";

/// Generate a fresh opaque identifier.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ── Agents ──────────────────────────────────────────────────────

/// Lifecycle status of an agent instance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Error,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    /// Running or paused: a live backend process is expected to exist.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl FromStr for AgentStatus {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "terminated" => Ok(Self::Terminated),
            other => Err(ConclaveError::Database(format!("unknown agent status '{}'", other))),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared configuration of an agent: which backend runs it and how.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Execution backend name (see `[runtimes.*]` in the config file).
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Backend-specific permission policy (e.g. "acceptEdits").
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A registered agent and its current lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInstance {
    pub id: String,
    pub name: String,
    pub config: AgentConfig,
    pub status: AgentStatus,
    /// Opaque resumption handle issued by the execution backend.
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for registering an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAgent {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub config: AgentConfig,
}

impl NewAgent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            config: AgentConfig::default(),
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.config.runtime = Some(runtime.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }
}

// ── Backend boundary ────────────────────────────────────────────

/// Token usage and cost reported by a backend at the end of a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// What the launcher asks a backend to do.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub agent_id: String,
    pub prompt: String,
    /// Session to resume; `None` starts a fresh conversation.
    pub resume_session: Option<String>,
    pub config: AgentConfig,
}

/// Raw event produced by an execution backend, after per-backend parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// The backend issued (or confirmed) a session identifier.
    SessionStarted { session_id: String },
    /// A chunk of assistant text.
    Text(String),
    /// The agent invoked a tool.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A tool returned to the agent.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// The backend reported a failure.
    Error(String),
    /// The turn finished.
    Done { usage: Option<Usage> },
}

/// Assistant message delta in the canonical stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssistantContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

/// Canonical event stream emitted by the launcher for every backend.
///
/// Every stream ends with exactly one `Done`, whatever happened before it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Assistant {
        content: AssistantContent,
    },
    User {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Error {
        message: String,
    },
    Done,
}

impl StreamEvent {
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: AssistantContent::Text { text: text.into() },
        }
    }

    /// Assistant text carried by this event, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Assistant {
                content: AssistantContent::Text { text },
            } => Some(text),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

// ── Event bus ───────────────────────────────────────────────────

/// A durable coordination event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub consumed: bool,
}

/// Filter for reading the event bus. Newest events come first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Only events not yet consumed. Pass `false` explicitly to see history.
    #[serde(default = "default_true")]
    pub unconsumed_only: bool,
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            source: None,
            unconsumed_only: true,
            limit: default_event_limit(),
        }
    }
}

impl EventQuery {
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    pub fn including_consumed(mut self) -> Self {
        self.unconsumed_only = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_event_limit() -> usize {
    50
}

// ── Blackboard ──────────────────────────────────────────────────

/// One versioned value on a team's blackboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlackboardEntry {
    pub key: String,
    pub team_id: String,
    pub value: serde_json::Value,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1, incremented on every write to the same (key, team).
    pub version: i64,
}

// ── Teams ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TeamStatus {
    #[default]
    Idle,
    Active,
}

impl TeamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
        }
    }
}

impl FromStr for TeamStatus {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "active" => Ok(Self::Active),
            other => Err(ConclaveError::Database(format!("unknown team status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamMember {
    pub agent_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl TeamMember {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            capabilities: vec![],
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub description: String,
    pub supervisor_id: Option<String>,
    pub members: Vec<TeamMember>,
    pub status: TeamStatus,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn member(&self, agent_id: &str) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.agent_id == agent_id)
    }

    /// Whether the agent is a member or the supervisor of this team.
    pub fn includes(&self, agent_id: &str) -> bool {
        self.member(agent_id).is_some() || self.supervisor_id.as_deref() == Some(agent_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTeam {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub supervisor_id: Option<String>,
    #[serde(default)]
    pub members: Vec<TeamMember>,
}

// ── Workflows ───────────────────────────────────────────────────

/// What starts a workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowTrigger {
    #[default]
    Manual,
    /// Seconds-resolution cron expression, e.g. `0 */5 * * * *`.
    Cron { schedule: String },
    /// Glob over event types with a single leading or trailing `*`.
    Event { pattern: String },
    Webhook,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Disabled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            other => Err(ConclaveError::Database(format!(
                "unknown workflow status '{}'",
                other
            ))),
        }
    }
}

/// One step of a workflow: a prompt sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "agentId")]
    pub agent_id: String,
    /// Prompt template; `{{dotted.key}}` reads from the run blackboard.
    pub prompt: String,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Backend used when the agent has to be created for this step.
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default, alias = "outputKey")]
    pub output_key: Option<String>,
    /// Seconds; the engine default applies when unset.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub retries: u32,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            depends_on: vec![],
            runtime: None,
            output_key: None,
            timeout: None,
            condition: None,
            retries: 0,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger: WorkflowTrigger,
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub last_run_status: Option<RunStatus>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or replacing a workflow definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkflow {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl NewWorkflow {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            trigger: WorkflowTrigger::Manual,
            steps,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(ConclaveError::Database(format!("unknown run status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStepResult {
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Number of times the step was executed (1 + retries used).
    #[serde(default)]
    pub attempts: u32,
}

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub step_results: BTreeMap<String, WorkflowStepResult>,
    /// Per-run scratch map, independent of the shared blackboard store.
    pub blackboard: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowRun {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStepResult> {
        self.step_results.get(step_id)
    }
}

// ── Traces ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Running,
    Completed,
    Error,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for TraceStatus {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(ConclaveError::Database(format!("unknown trace status '{}'", other))),
        }
    }
}

/// Observability record of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub id: String,
    pub agent_id: String,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub status: TraceStatus,
    pub prompt_preview: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
}

/// A sub-operation inside a trace (currently: one tool call).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}
