use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use conclave_core::progress::{Progress, ProgressBus};
use conclave_core::types::{StepStatus, StreamEvent, WorkflowRun};

use crate::normalize::render_line;

/// JSONL log of workflow runs.
///
/// Subscribes to the progress bus and writes one file per run at
/// `{log_dir}/{workflow_id}/{run_id}.jsonl`, flushing after every line.
/// `level` controls verbosity: 1=run status, 2=+step transitions,
/// 3=+agent output.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
    open: HashMap<String, OpenRun>,
}

struct OpenRun {
    writer: BufWriter<File>,
    steps: BTreeMap<String, StepStatus>,
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl<'a> LogEntry<'a> {
    fn new(run_id: &'a str, event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id,
            event_type,
            step_id: None,
            detail: None,
        }
    }

    fn step(mut self, step_id: &'a str) -> Self {
        self.step_id = Some(step_id);
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self {
            log_dir,
            level: level.clamp(1, 3),
            open: HashMap::new(),
        }
    }

    /// Log until cancelled or until the bus closes.
    pub async fn run(mut self, progress: &ProgressBus, cancel: CancellationToken) {
        let mut rx = progress.subscribe();
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => self.handle(&event).await,
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "RunLogger lagged, skipped events"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
        for (_, mut run) in self.open.drain() {
            run.writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn handle(&mut self, event: &Progress) {
        match event {
            Progress::RunUpdated { run } => self.on_run(run).await,
            Progress::AgentOutput {
                agent_id,
                run_id: Some(run_id),
                step_id,
                event,
            } if self.level >= 3 => {
                if matches!(event, StreamEvent::Done) {
                    return;
                }
                let mut entry = LogEntry::new(run_id, "agent_output").detail(serde_json::json!({
                    "agent_id": agent_id,
                    "line": render_line(event),
                }));
                if let Some(step_id) = step_id {
                    entry = entry.step(step_id);
                }
                self.write(run_id, &entry).await;
            }
            _ => {}
        }
    }

    async fn on_run(&mut self, run: &WorkflowRun) {
        if !self.open.contains_key(&run.id) {
            match open_log(&self.log_dir, run).await {
                Ok(writer) => {
                    self.open.insert(
                        run.id.clone(),
                        OpenRun {
                            writer,
                            steps: BTreeMap::new(),
                        },
                    );
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "Failed to open run log");
                    return;
                }
            }
            let entry = LogEntry::new(&run.id, "run_started")
                .detail(serde_json::json!({ "workflow_id": run.workflow_id }));
            self.write(&run.id, &entry).await;
        }

        if self.level >= 2 {
            let mut changed: Vec<(&String, StepStatus)> = Vec::new();
            if let Some(open) = self.open.get_mut(&run.id) {
                for (id, result) in &run.step_results {
                    if open.steps.insert(id.clone(), result.status) != Some(result.status) {
                        changed.push((id, result.status));
                    }
                }
            }
            for (step_id, status) in changed {
                if status == StepStatus::Pending {
                    continue;
                }
                let result = run.step(step_id);
                let entry = LogEntry::new(&run.id, "step_status")
                    .step(step_id)
                    .detail(serde_json::json!({
                        "status": status,
                        "error": result.and_then(|r| r.error.as_deref()),
                        "trace_id": result.and_then(|r| r.trace_id.as_deref()),
                    }));
                self.write(&run.id, &entry).await;
            }
        }

        if run.status.is_terminal() {
            let entry = LogEntry::new(&run.id, "run_finished").detail(serde_json::json!({
                "status": run.status,
                "blackboard_keys": run.blackboard.keys().collect::<Vec<_>>(),
            }));
            self.write(&run.id, &entry).await;
            if let Some(mut open) = self.open.remove(&run.id) {
                open.writer.flush().await.ok();
            }
        }
    }

    async fn write(&mut self, run_id: &str, entry: &LogEntry<'_>) {
        let Some(open) = self.open.get_mut(run_id) else {
            return;
        };
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize run log entry");
                return;
            }
        };
        let line = format!("{}\n", json);
        if let Err(e) = open.writer.write_all(line.as_bytes()).await {
            error!(run_id = %run_id, error = %e, "Failed to write run log entry");
            return;
        }
        if let Err(e) = open.writer.flush().await {
            error!(run_id = %run_id, error = %e, "Failed to flush run log");
        }
    }
}

async fn open_log(log_dir: &Path, run: &WorkflowRun) -> std::io::Result<BufWriter<File>> {
    let dir = log_dir.join(&run.workflow_id);
    tokio::fs::create_dir_all(&dir).await?;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}.jsonl", run.id)))
        .await?;
    Ok(BufWriter::new(file))
}
