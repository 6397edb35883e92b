use std::path::{Path, PathBuf};

use conclave_agent::validate_trigger;
use conclave_core::config::AppConfig;
use conclave_store::Stores;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Print a health report. Returns the number of failed checks.
pub fn run_doctor(config: &AppConfig) -> usize {
    let mut checks = vec![check_workspace(config)];

    match Stores::open(&config.db_path()) {
        Ok(stores) => {
            checks.push(CheckResult::ok("Database", config.db_path().display().to_string()));
            checks.push(check_workflows(&stores));
        }
        Err(e) => checks.push(CheckResult::fail(
            "Database",
            format!("{}: {}", config.db_path().display(), e),
        )),
    }

    checks.push(check_default_runtime(config));
    checks.extend(check_runtime_commands(config));
    checks.push(check_webhook(config));

    let mut ok_count = 0;
    let mut fail_count = 0;
    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }
    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if !ws.is_dir() {
        return CheckResult::fail("Workspace", format!("{} (does not exist)", ws.display()));
    }
    let scratch = ws.join(".doctor_write_test");
    match std::fs::write(&scratch, "ok") {
        Ok(_) => {
            std::fs::remove_file(&scratch).ok();
            CheckResult::ok("Workspace", ws.display().to_string())
        }
        Err(e) => CheckResult::fail("Workspace", format!("{} (not writable: {})", ws.display(), e)),
    }
}

fn check_workflows(stores: &Stores) -> CheckResult {
    let workflows = match stores.workflows.list() {
        Ok(workflows) => workflows,
        Err(e) => return CheckResult::fail("Workflows", e.to_string()),
    };
    let broken: Vec<String> = workflows
        .iter()
        .filter_map(|w| validate_trigger(&w.trigger).err().map(|e| format!("{}: {}", w.id, e)))
        .collect();
    if broken.is_empty() {
        CheckResult::ok("Workflows", format!("{} defined, all triggers valid", workflows.len()))
    } else {
        CheckResult::fail("Workflows", broken.join("; "))
    }
}

fn check_default_runtime(config: &AppConfig) -> CheckResult {
    let name = &config.launcher.default_runtime;
    if config.runtimes.contains_key(name) {
        CheckResult::ok("Default runtime", name.clone())
    } else {
        CheckResult::fail(
            "Default runtime",
            format!("'{}' has no [runtimes.{}] section", name, name),
        )
    }
}

fn check_runtime_commands(config: &AppConfig) -> Vec<CheckResult> {
    let mut names: Vec<&String> = config.runtimes.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let label = format!("Runtime '{}'", name);
            let command = &config.runtimes[name].command;
            match find_command(command) {
                Some(path) => CheckResult::ok(&label, path.display().to_string()),
                None => CheckResult::fail(&label, format!("command '{}' not found", command)),
            }
        })
        .collect()
}

fn check_webhook(config: &AppConfig) -> CheckResult {
    match config.gateway.webhook_token.as_deref() {
        Some(token) if token.starts_with("${") => CheckResult::fail(
            "Webhook token",
            format!("environment variable not set: {}", token),
        ),
        Some(_) => CheckResult::ok("Webhook token", "configured"),
        None => CheckResult::ok("Webhook token", "none (webhook route is unauthenticated)"),
    }
}

/// Resolve a command the way a shell would: paths as-is, bare names on PATH.
fn find_command(command: &str) -> Option<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}
