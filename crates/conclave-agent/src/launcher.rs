use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::progress::{Progress, ProgressBus};
use conclave_core::traits::{AgentBackend, HandleTable, LiveHandle, LogBuffer};
use conclave_core::types::{
    new_id, AgentConfig, AgentInstance, AgentStatus, BackendEvent, BackendRequest, NewAgent,
    StreamEvent, TraceStatus, Usage,
};
use conclave_store::{AgentStore, TraceOrigin, TraceStore};

use crate::backends::BackendRegistry;
use crate::normalize::{normalize, render_line};

const EVENT_BUFFER: usize = 256;

/// Error reported on a stream whose launch was stopped.
pub const INTERRUPTED: &str = "interrupted";

/// How a launch relates to earlier conversations and to workflow runs.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Resume the stored session instead of starting fresh.
    pub resume: bool,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
}

impl LaunchOptions {
    pub fn resume() -> Self {
        Self {
            resume: true,
            ..Self::default()
        }
    }

    pub fn for_step(run_id: &str, step_id: &str) -> Self {
        Self {
            resume: false,
            run_id: Some(run_id.to_string()),
            step_id: Some(step_id.to_string()),
        }
    }
}

/// A launch in flight. `events` always ends with exactly one `Done`.
pub struct LaunchedRun {
    pub agent_id: String,
    pub trace_id: String,
    /// This launch's own handle, for stopping it after a newer launch of
    /// the same agent has taken the handle table slot.
    pub handle: LiveHandle,
    pub events: BoxStream<'static, StreamEvent>,
}

/// What a drained launch produced.
#[derive(Debug, Clone, Default)]
pub struct LaunchOutcome {
    pub text: String,
    pub error: Option<String>,
}

impl LaunchedRun {
    /// Drain the stream, concatenating assistant text.
    pub async fn collect(mut self) -> LaunchOutcome {
        let mut outcome = LaunchOutcome::default();
        while let Some(event) = self.events.next().await {
            match event {
                StreamEvent::Error { message } => outcome.error = Some(message),
                StreamEvent::Done => break,
                other => {
                    if let Some(text) = other.text() {
                        outcome.text.push_str(text);
                    }
                }
            }
        }
        outcome
    }
}

/// Bridges agent instances to execution backends.
///
/// Owns every agent status transition: the registry is only written
/// through `set_status`, `settle`, and session capture.
#[derive(Clone)]
pub struct AgentLauncher {
    agents: AgentStore,
    traces: TraceStore,
    backends: Arc<BackendRegistry>,
    handles: Arc<dyn HandleTable>,
    logs: Arc<dyn LogBuffer>,
    progress: Arc<ProgressBus>,
}

impl AgentLauncher {
    pub fn new(
        agents: AgentStore,
        traces: TraceStore,
        backends: Arc<BackendRegistry>,
        handles: Arc<dyn HandleTable>,
        logs: Arc<dyn LogBuffer>,
        progress: Arc<ProgressBus>,
    ) -> Self {
        Self {
            agents,
            traces,
            backends,
            handles,
            logs,
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    // ── Registry ────────────────────────────────────────────────

    pub fn create_agent(&self, new: NewAgent) -> Result<AgentInstance> {
        let id = new.id.unwrap_or_else(new_id);
        if self.agents.find(&id)?.is_some() {
            return Err(ConclaveError::AlreadyExists(format!("agent {}", id)));
        }
        let agent = AgentInstance {
            id,
            name: new.name,
            config: new.config,
            status: AgentStatus::Idle,
            session_id: None,
            started_at: None,
            last_activity: None,
            error: None,
            created_at: Utc::now(),
        };
        self.agents.insert(&agent)?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent created");
        Ok(agent)
    }

    pub fn get_agent(&self, id: &str) -> Result<AgentInstance> {
        self.agents.get(id)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentInstance>> {
        self.agents.list()
    }

    pub fn update_agent_config(
        &self,
        id: &str,
        name: Option<&str>,
        config: AgentConfig,
    ) -> Result<AgentInstance> {
        let current = self.agents.get(id)?;
        self.agents
            .update_config(id, name.unwrap_or(&current.name), &config)
    }

    /// Stop the agent if it is live, then remove it.
    pub async fn delete_agent(&self, id: &str) -> Result<bool> {
        if self.agents.find(id)?.is_none() {
            return Ok(false);
        }
        self.stop(id).await?;
        self.logs.clear(id);
        self.agents.delete(id)
    }

    /// The agent with this id, created on the spot when it does not exist.
    pub fn ensure_agent(&self, id: &str, runtime: Option<&str>) -> Result<AgentInstance> {
        if let Some(agent) = self.agents.find(id)? {
            return Ok(agent);
        }
        let mut new = NewAgent::new(id, id);
        new.config.runtime = runtime.map(str::to_string);
        debug!(agent_id = %id, runtime = ?runtime, "Creating ephemeral agent");
        match self.create_agent(new) {
            Ok(agent) => Ok(agent),
            // Another task created it first
            Err(ConclaveError::AlreadyExists(_)) => self.agents.get(id),
            Err(e) => Err(e),
        }
    }

    pub fn logs(&self, agent_id: &str) -> Vec<String> {
        self.logs.lines(agent_id)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Fresh session.
    pub async fn launch(&self, agent_id: &str, prompt: &str) -> Result<LaunchedRun> {
        self.start(agent_id, prompt, LaunchOptions::default()).await
    }

    /// Resume the stored session when there is one, otherwise start fresh.
    pub async fn prompt(&self, agent_id: &str, message: &str) -> Result<LaunchedRun> {
        self.start(agent_id, message, LaunchOptions::resume()).await
    }

    /// Start a backend turn. Unknown agents fail here; every other failure
    /// is reported inside the returned stream.
    pub async fn start(
        &self,
        agent_id: &str,
        prompt: &str,
        opts: LaunchOptions,
    ) -> Result<LaunchedRun> {
        let agent = self.agents.get(agent_id)?;
        let resume_session = if opts.resume {
            agent.session_id.clone()
        } else {
            None
        };

        // The previous launch keeps running; only `stop_launch` reaches it now
        let handle = LiveHandle::new();
        if self.handles.insert(agent_id, handle.clone()).is_some() {
            debug!(agent_id = %agent_id, "Replacing live handle of previous launch");
        }

        self.set_status(agent_id, AgentStatus::Running, None)?;
        let origin = TraceOrigin {
            run_id: opts.run_id.clone(),
            step_id: opts.step_id.clone(),
        };
        let trace = self.traces.start_trace(agent_id, &origin, prompt)?;
        info!(
            agent_id = %agent_id,
            trace_id = %trace.id,
            resume = resume_session.is_some(),
            "Launching agent"
        );

        let request = BackendRequest {
            agent_id: agent_id.to_string(),
            prompt: prompt.to_string(),
            resume_session: resume_session.clone(),
            config: agent.config.clone(),
        };
        let backend = self.backends.resolve(agent.config.runtime.as_deref());

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let driver = Driver {
            launcher: self.clone(),
            agent_id: agent_id.to_string(),
            trace_id: trace.id.clone(),
            origin,
            session_id: resume_session,
            tx,
        };
        tokio::spawn(driver.run(backend, request, handle.clone()));

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(LaunchedRun {
            agent_id: agent_id.to_string(),
            trace_id: trace.id,
            handle,
            events: events.boxed(),
        })
    }

    /// Interrupt the live handle if one is tracked and mark the agent
    /// terminated. Returns whether a live handle was interrupted.
    pub async fn stop(&self, agent_id: &str) -> Result<bool> {
        self.agents.get(agent_id)?;
        let interrupted = match self.handles.remove(agent_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        };
        self.set_status(agent_id, AgentStatus::Terminated, None)?;
        info!(agent_id = %agent_id, interrupted, "Agent stopped");
        Ok(interrupted)
    }

    /// Interrupt one specific launch. The agent is marked terminated only
    /// when that launch is still the tracked one; a newer launch owns the
    /// status otherwise. Returns whether the launch was the tracked one.
    pub async fn stop_launch(&self, agent_id: &str, handle: &LiveHandle) -> Result<bool> {
        handle.cancel.cancel();
        if !self.handles.release(agent_id, &handle.launch_id) {
            debug!(agent_id = %agent_id, launch_id = %handle.launch_id, "Stopped superseded launch");
            return Ok(false);
        }
        self.set_status(agent_id, AgentStatus::Terminated, None)?;
        info!(agent_id = %agent_id, launch_id = %handle.launch_id, "Agent launch stopped");
        Ok(true)
    }

    /// The single place that stamps a status change.
    fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        error: Option<&str>,
    ) -> Result<AgentInstance> {
        let agent = self.agents.update_status(agent_id, status, error)?;
        self.progress.publish(Progress::AgentStatus {
            agent_id: agent_id.to_string(),
            status,
        });
        Ok(agent)
    }

    /// Move a still-running instance to `status`. Instances that were
    /// stopped or relaunched in the meantime are left alone.
    fn settle(&self, agent_id: &str, status: AgentStatus, error: Option<&str>) -> Result<bool> {
        let changed = self
            .agents
            .update_status_if(agent_id, AgentStatus::Running, status, error)?;
        if changed.is_some() {
            self.progress.publish(Progress::AgentStatus {
                agent_id: agent_id.to_string(),
                status,
            });
        }
        Ok(changed.is_some())
    }
}

/// Background task relaying one backend stream.
struct Driver {
    launcher: AgentLauncher,
    agent_id: String,
    trace_id: String,
    origin: TraceOrigin,
    session_id: Option<String>,
    tx: mpsc::Sender<StreamEvent>,
}

enum Ending {
    Finished,
    Failed(String),
    Cancelled,
}

impl Driver {
    async fn run(
        mut self,
        backend: Result<Arc<dyn AgentBackend>>,
        request: BackendRequest,
        handle: LiveHandle,
    ) {
        self.emit(StreamEvent::Status {
            status: AgentStatus::Running,
            session_id: self.session_id.clone(),
        })
        .await;

        let mut usage: Option<Usage> = None;
        let ending = match backend {
            Ok(backend) => self.relay(backend, request, &handle, &mut usage).await,
            Err(e) => {
                let message = e.to_string();
                self.emit(StreamEvent::Error {
                    message: message.clone(),
                })
                .await;
                Ending::Failed(message)
            }
        };

        let launcher = self.launcher.clone();
        // A launch superseded by a newer one leaves the status to it
        let current = launcher.handles.release(&self.agent_id, &handle.launch_id);
        let (trace_status, trace_error) = match &ending {
            Ending::Finished => {
                if current {
                    if let Err(e) = launcher.settle(&self.agent_id, AgentStatus::Idle, None) {
                        warn!(agent_id = %self.agent_id, error = %e, "Failed to settle agent status");
                    }
                }
                (TraceStatus::Completed, None)
            }
            Ending::Failed(message) => {
                error!(agent_id = %self.agent_id, error = %message, "Agent backend failed");
                if current {
                    if let Err(e) =
                        launcher.settle(&self.agent_id, AgentStatus::Error, Some(message))
                    {
                        warn!(agent_id = %self.agent_id, error = %e, "Failed to record agent error");
                    }
                }
                (TraceStatus::Error, Some(message.clone()))
            }
            Ending::Cancelled => {
                debug!(agent_id = %self.agent_id, "Agent launch interrupted");
                (TraceStatus::Error, Some(INTERRUPTED.to_string()))
            }
        };

        if let Err(e) = launcher.traces.finish_trace(
            &self.trace_id,
            trace_status,
            usage.as_ref(),
            trace_error.as_deref(),
        ) {
            warn!(trace_id = %self.trace_id, error = %e, "Failed to close trace");
        }
        if matches!(ending, Ending::Cancelled) {
            self.emit(StreamEvent::Error {
                message: INTERRUPTED.to_string(),
            })
            .await;
        }
        self.emit(StreamEvent::Done).await;
    }

    async fn relay(
        &mut self,
        backend: Arc<dyn AgentBackend>,
        request: BackendRequest,
        handle: &LiveHandle,
        usage: &mut Option<Usage>,
    ) -> Ending {
        let mut events = match backend.run(request, handle.cancel.clone()).await {
            Ok(events) => events,
            Err(e) => {
                let message = e.to_string();
                self.emit(StreamEvent::Error {
                    message: message.clone(),
                })
                .await;
                return Ending::Failed(message);
            }
        };

        let mut open_spans: HashMap<String, String> = HashMap::new();
        let mut failure: Option<String> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return Ending::Cancelled,
                next = events.next() => next,
            };
            let event = match next {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    let message = e.to_string();
                    self.emit(StreamEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                    return Ending::Failed(message);
                }
            };

            if let Err(e) = self.launcher.agents.touch(&self.agent_id) {
                warn!(agent_id = %self.agent_id, error = %e, "Failed to stamp activity");
            }
            self.observe(&event, &mut open_spans, &mut failure, usage);

            if let Some(normalized) = normalize(&event) {
                self.emit(normalized).await;
            }
            if matches!(event, BackendEvent::Done { .. }) {
                break;
            }
        }

        match failure {
            Some(message) => Ending::Failed(message),
            None => Ending::Finished,
        }
    }

    /// Side effects of a backend event: session capture, spans, usage.
    fn observe(
        &mut self,
        event: &BackendEvent,
        open_spans: &mut HashMap<String, String>,
        failure: &mut Option<String>,
        usage: &mut Option<Usage>,
    ) {
        let launcher = &self.launcher;
        match event {
            BackendEvent::SessionStarted { session_id } => {
                if self.session_id.as_deref() != Some(session_id.as_str()) {
                    match launcher.agents.set_session(&self.agent_id, session_id) {
                        Ok(()) => {
                            debug!(agent_id = %self.agent_id, session_id = %session_id, "Session captured");
                            self.session_id = Some(session_id.clone());
                        }
                        Err(e) => {
                            warn!(agent_id = %self.agent_id, error = %e, "Failed to persist session id")
                        }
                    }
                }
            }
            BackendEvent::ToolCall { id, name, input } => {
                match launcher.traces.start_span(
                    &self.trace_id,
                    name,
                    serde_json::json!({ "tool_use_id": id, "input": input }),
                ) {
                    Ok(span) => {
                        open_spans.insert(id.clone(), span.id);
                    }
                    Err(e) => warn!(trace_id = %self.trace_id, error = %e, "Failed to open span"),
                }
            }
            BackendEvent::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                if let Some(span_id) = open_spans.remove(tool_use_id) {
                    if let Err(e) = launcher
                        .traces
                        .end_span(&span_id, serde_json::json!({ "is_error": is_error }))
                    {
                        warn!(trace_id = %self.trace_id, error = %e, "Failed to close span");
                    }
                }
            }
            BackendEvent::Error(message) => *failure = Some(message.clone()),
            BackendEvent::Done { usage: reported } => *usage = reported.clone(),
            BackendEvent::Text(_) => {}
        }
    }

    /// Log, broadcast, and forward one canonical event. A dropped receiver
    /// does not stop the driver: status and trace still get recorded.
    async fn emit(&self, event: StreamEvent) {
        self.launcher
            .logs
            .append(&self.agent_id, render_line(&event));
        self.launcher.progress.publish(Progress::AgentOutput {
            agent_id: self.agent_id.clone(),
            run_id: self.origin.run_id.clone(),
            step_id: self.origin.step_id.clone(),
            event: event.clone(),
        });
        let _ = self.tx.send(event).await;
    }
}
