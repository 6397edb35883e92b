use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConclaveError {
    // Lookup errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Team not found: {0}")]
    TeamNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow run not found: {0}")]
    RunNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // Backend errors
    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("No backend registered for runtime: {0}")]
    UnknownRuntime(String),

    // Workflow errors
    #[error("Step timed out after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    // Tool protocol errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConclaveError {
    /// Whether this error means "the thing you asked about does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound(_)
                | Self::TeamNotFound(_)
                | Self::WorkflowNotFound(_)
                | Self::RunNotFound(_)
                | Self::EventNotFound(_)
                | Self::TraceNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
