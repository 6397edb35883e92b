use std::io::Write;

use conclave_agent::{BackendRegistry, Conclave};
use conclave_core::config::{AppConfig, OutputFormat};
use conclave_core::types::{NewWorkflow, WorkflowTrigger};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
workspace = "/tmp/conclave-test"

[storage]
path = "state/conclave.db"

[launcher]
default_runtime = "echo"
log_buffer_lines = 50

[workflow]
default_step_timeout_secs = 30

[triggers]
event_poll_interval_secs = 5

[log]
enabled = false
level = 3

[gateway]
bind = "0.0.0.0:9999"
webhook_token = "hook-token"

[runtimes.echo]
command = "echo"
format = "text"

[runtimes.claude]
command = "claude"
args = ["-p", "--output-format", "stream-json", "--verbose"]
resume_args = ["--resume", "{session_id}"]

[runtimes.claude.flags]
model = "--model"
system_prompt = "--append-system-prompt"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(
        config.db_path(),
        std::path::PathBuf::from("/tmp/conclave-test/state/conclave.db")
    );
    assert_eq!(config.launcher.default_runtime, "echo");
    assert_eq!(config.launcher.log_buffer_lines, 50);
    assert_eq!(config.workflow.default_step_timeout_secs, 30);
    assert_eq!(config.triggers.event_poll_interval_secs, 5);
    assert!(!config.log.enabled);
    assert_eq!(config.log.level, 3);
    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert_eq!(config.gateway.webhook_token.as_deref(), Some("hook-token"));
    assert_eq!(config.runtimes["echo"].format, OutputFormat::Text);
    assert_eq!(config.runtimes["claude"].format, OutputFormat::StreamJson);
    assert_eq!(
        config.runtimes["claude"].flags.system_prompt.as_deref(),
        Some("--append-system-prompt")
    );

    let registry = BackendRegistry::from_config(&config);
    assert_eq!(registry.names(), vec!["claude", "echo"]);
    assert_eq!(registry.default_runtime(), "echo");
}

#[test]
fn test_env_var_in_webhook_token() {
    std::env::set_var("CONCLAVE_TEST_HOOK_TOKEN", "from-env");
    let config = AppConfig::parse("[gateway]\nwebhook_token = \"${CONCLAVE_TEST_HOOK_TOKEN}\"")
        .expect("parse config");
    assert_eq!(config.gateway.webhook_token.as_deref(), Some("from-env"));
    std::env::remove_var("CONCLAVE_TEST_HOOK_TOKEN");
}

#[test]
fn test_open_creates_database_in_workspace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        "workspace = \"{}\"\n[storage]\npath = \"nested/conclave.db\"\n[log]\nenabled = false",
        dir.path().display()
    );
    let config = AppConfig::parse(&toml).expect("parse config");
    let db_path = config.db_path();

    let app = Conclave::open(config, BackendRegistry::new("none")).expect("open conclave");
    assert!(db_path.exists());
    assert!(app.launcher.list_agents().expect("list agents").is_empty());
}

#[test]
fn test_workflow_definition_file_in_toml() {
    let definition = r#"
id = "nightly-review"
name = "Nightly review"
description = "Summarize the day's changes, then review them"

[trigger]
type = "cron"
schedule = "0 0 2 * * *"

[[steps]]
id = "summarize"
agent_id = "scribe"
prompt = "Summarize today's commits"
output_key = "summary"

[[steps]]
id = "review"
agent_id = "reviewer"
prompt = "Review: {{summary}}"
depends_on = ["summarize"]
timeout = 600
retries = 1
"#;
    let spec: NewWorkflow = toml::from_str(definition).expect("parse workflow");
    assert_eq!(spec.id.as_deref(), Some("nightly-review"));
    assert!(matches!(
        spec.trigger,
        WorkflowTrigger::Cron { ref schedule } if schedule == "0 0 2 * * *"
    ));
    assert_eq!(spec.steps.len(), 2);
    assert_eq!(spec.steps[1].depends_on, vec!["summarize"]);
    assert_eq!(spec.steps[1].timeout, Some(600));
    assert_eq!(spec.steps[1].retries, 1);
    conclave_agent::validate_trigger(&spec.trigger).expect("valid cron");
}
