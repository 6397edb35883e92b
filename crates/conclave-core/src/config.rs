use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};

/// Top-level Conclave configuration. Every section has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for the database and run logs.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub triggers: TriggersConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Named execution backends, selected by an agent's `runtime`.
    #[serde(default)]
    pub runtimes: HashMap<String, RuntimeConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            storage: StorageConfig::default(),
            launcher: LauncherConfig::default(),
            workflow: WorkflowConfig::default(),
            triggers: TriggersConfig::default(),
            log: LogConfig::default(),
            gateway: GatewayConfig::default(),
            runtimes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; relative paths resolve against the workspace.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_runtime")]
    pub default_runtime: String,
    /// Lines kept per agent in the in-memory log buffer.
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            default_runtime: default_runtime(),
            log_buffer_lines: default_log_buffer_lines(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    /// How often event-triggered workflows poll the event bus.
    #[serde(default = "default_event_poll_interval_secs")]
    pub event_poll_interval_secs: u64,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            event_poll_interval_secs: default_event_poll_interval_secs(),
        }
    }
}

/// JSONL run logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for run logs. Defaults to `<workspace>/logs`.
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run status, 2 = + step transitions, 3 = + agent output.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required by the webhook route when set.
    #[serde(default)]
    pub webhook_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_token: None,
        }
    }
}

/// Line format a command backend writes to stdout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON object per line (`system`, `assistant`, `user`, `result`).
    #[default]
    StreamJson,
    /// Every line is assistant text.
    Text,
}

/// How the prompt reaches a command backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptVia {
    /// Appended as the last argument.
    #[default]
    Arg,
    /// Written to stdin, which is then closed.
    Stdin,
}

/// An external agent CLI driven as a child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra args when resuming; `{session_id}` is substituted.
    #[serde(default)]
    pub resume_args: Vec<String>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub prompt_via: PromptVia,
    /// Flags that carry agent settings, e.g. `model = "--model"`.
    #[serde(default)]
    pub flags: RuntimeFlags,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Command-line flag names for agent settings. An unset flag means the
/// setting is only passed through the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeFlags {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_turns: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
}

fn default_workspace() -> String {
    "~/.conclave".to_string()
}
fn default_db_path() -> String {
    "conclave.db".to_string()
}
fn default_runtime() -> String {
    "claude".to_string()
}
fn default_log_buffer_lines() -> usize {
    500
}
fn default_step_timeout_secs() -> u64 {
    300
}
fn default_event_poll_interval_secs() -> u64 {
    15
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> u8 {
    2
}
fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConclaveError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| ConclaveError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    pub fn db_path(&self) -> PathBuf {
        let path = expand_home(&self.storage.path);
        if path.is_absolute() {
            path
        } else {
            self.workspace_dir().join(path)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CONCLAVE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CONCLAVE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CONCLAVE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CONCLAVE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CONCLAVE_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.storage.path, "conclave.db");
        assert_eq!(config.launcher.default_runtime, "claude");
        assert_eq!(config.launcher.log_buffer_lines, 500);
        assert_eq!(config.workflow.default_step_timeout_secs, 300);
        assert_eq!(config.triggers.event_poll_interval_secs, 15);
        assert!(config.log.enabled);
        assert_eq!(config.log.level, 2);
        assert_eq!(config.gateway.bind, "127.0.0.1:18790");
        assert!(config.runtimes.is_empty());
    }

    #[test]
    fn test_runtime_section() {
        let config = AppConfig::parse(
            r#"
[runtimes.echo]
command = "echo-agent"
args = ["--json"]
resume_args = ["--resume", "{session_id}"]
format = "text"
prompt_via = "stdin"

[runtimes.echo.flags]
model = "--model"
"#,
        )
        .unwrap();
        let rt = &config.runtimes["echo"];
        assert_eq!(rt.command, "echo-agent");
        assert_eq!(rt.format, OutputFormat::Text);
        assert_eq!(rt.prompt_via, PromptVia::Stdin);
        assert_eq!(rt.resume_args.len(), 2);
        assert_eq!(rt.flags.model.as_deref(), Some("--model"));
        assert!(rt.flags.system_prompt.is_none());
    }

    #[test]
    fn test_db_path_relative_to_workspace() {
        let config = AppConfig::parse("workspace = \"/srv/conclave\"").unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/srv/conclave/conclave.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/conclave/logs"));

        let config = AppConfig::parse(
            "workspace = \"/srv/conclave\"\n[storage]\npath = \"/tmp/other.db\"",
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::parse("workspace = [").unwrap_err();
        assert!(matches!(err, ConclaveError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = AppConfig::load(Path::new("/nonexistent/conclave.toml")).unwrap_err();
        assert!(matches!(err, ConclaveError::ConfigNotFound(_)));
    }
}
