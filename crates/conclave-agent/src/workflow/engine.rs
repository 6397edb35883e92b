use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::progress::{Progress, ProgressBus};
use conclave_core::types::{
    new_id, NewWorkflow, RunStatus, StepStatus, Workflow, WorkflowRun, WorkflowStatus,
    WorkflowStep, WorkflowStepResult,
};
use conclave_store::WorkflowStore;

use super::blackboard::RunBlackboard;
use super::condition::evaluate_condition;
use super::layers::resolve_layers;
use super::template::interpolate;
use crate::launcher::{AgentLauncher, LaunchOptions};
use crate::triggers::validate_trigger;

/// Error recorded on a step that outlived its deadline.
pub const STEP_TIMED_OUT: &str = "Step timed out";

/// Reject definitions the engine cannot run: empty or duplicate step ids,
/// steps without an agent, and dependencies on steps that do not exist.
/// Cycles are accepted; the layer resolver degrades them at run time.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<()> {
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(ConclaveError::InvalidWorkflow("step with empty id".into()));
        }
        if step.agent_id.trim().is_empty() {
            return Err(ConclaveError::InvalidWorkflow(format!(
                "step '{}' has no agent",
                step.id
            )));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(ConclaveError::InvalidWorkflow(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }
    for step in steps {
        if let Some(dep) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(ConclaveError::InvalidWorkflow(format!(
                "step '{}' depends on unknown step '{}'",
                step.id, dep
            )));
        }
    }
    Ok(())
}

/// Runs workflows layer by layer through the agent launcher.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: WorkflowStore,
    launcher: AgentLauncher,
    progress: Arc<ProgressBus>,
    default_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(
        store: WorkflowStore,
        launcher: AgentLauncher,
        progress: Arc<ProgressBus>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            progress,
            default_timeout,
        }
    }

    // ── Definitions ─────────────────────────────────────────────

    pub fn create_workflow(&self, spec: NewWorkflow) -> Result<Workflow> {
        validate_steps(&spec.steps)?;
        validate_trigger(&spec.trigger)?;
        let id = spec.id.unwrap_or_else(new_id);
        match self.store.get(&id) {
            Ok(_) => return Err(ConclaveError::AlreadyExists(format!("workflow {}", id))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let now = Utc::now();
        let workflow = Workflow {
            id,
            name: spec.name,
            description: spec.description,
            trigger: spec.trigger,
            steps: spec.steps,
            status: WorkflowStatus::Active,
            last_run_status: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.save(&workflow)?;
        info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "Workflow created");
        Ok(workflow)
    }

    /// Replace the definition, keeping identity and run history.
    pub fn update_workflow(&self, id: &str, spec: NewWorkflow) -> Result<Workflow> {
        validate_steps(&spec.steps)?;
        validate_trigger(&spec.trigger)?;
        let mut workflow = self.store.get(id)?;
        workflow.name = spec.name;
        workflow.description = spec.description;
        workflow.trigger = spec.trigger;
        workflow.steps = spec.steps;
        workflow.updated_at = Utc::now();
        self.store.save(&workflow)?;
        Ok(workflow)
    }

    pub fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<Workflow> {
        let mut workflow = self.store.get(id)?;
        workflow.status = status;
        workflow.updated_at = Utc::now();
        self.store.save(&workflow)?;
        Ok(workflow)
    }

    pub fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.store.get(id)
    }

    pub fn list_workflows(&self) -> Result<Vec<Workflow>> {
        self.store.list()
    }

    pub fn delete_workflow(&self, id: &str) -> Result<bool> {
        self.store.delete(id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.store.get_run(run_id)
    }

    pub fn list_runs(&self, workflow_id: &str, limit: usize) -> Result<Vec<WorkflowRun>> {
        self.store.list_runs(workflow_id, limit)
    }

    // ── Execution ───────────────────────────────────────────────

    /// Execute a workflow to completion and return the final run record.
    ///
    /// The run is persisted and broadcast after every layer and every retry,
    /// so `get_run` shows progress while this future is pending.
    pub async fn run_workflow(&self, workflow_id: &str, input: Option<Value>) -> Result<WorkflowRun> {
        let workflow = self.store.get(workflow_id)?;
        let started = Instant::now();
        let mut board = RunBlackboard::from_input(input);
        let mut run = WorkflowRun {
            id: new_id(),
            workflow_id: workflow.id.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            step_results: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), WorkflowStepResult::default()))
                .collect::<BTreeMap<_, _>>(),
            blackboard: board.data().clone(),
        };
        info!(workflow_id = %workflow.id, run_id = %run.id, "Workflow run started");
        self.persist(&mut run, &board)?;

        if let Err(e) = self.execute_layers(&workflow, &mut run, &mut board).await {
            self.abandon(&mut run, &board, &e);
            return Err(e);
        }

        if run.status == RunStatus::Running {
            run.status = RunStatus::Completed;
        }
        run.completed_at = Some(Utc::now());
        if let Err(e) = self
            .persist(&mut run, &board)
            .and_then(|_| self.store.record_last_run(&workflow.id, &run))
        {
            self.abandon(&mut run, &board, &e);
            return Err(e);
        }
        info!(
            workflow_id = %workflow.id,
            run_id = %run.id,
            status = %run.status.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Workflow run finished"
        );
        Ok(run)
    }

    /// Run every layer in order, stopping after the first layer that still
    /// has a failed step once its retries are spent.
    async fn execute_layers(
        &self,
        workflow: &Workflow,
        run: &mut WorkflowRun,
        board: &mut RunBlackboard,
    ) -> Result<()> {
        for (n, layer) in resolve_layers(&workflow.steps).into_iter().enumerate() {
            debug!(run_id = %run.id, layer = n, steps = layer.len(), "Executing layer");

            let mut runnable = Vec::new();
            for step in layer.iter().copied() {
                if should_run(step, board) {
                    let result = run.step_results.entry(step.id.clone()).or_default();
                    result.status = StepStatus::Running;
                    result.started_at = Some(Utc::now());
                    runnable.push(step);
                } else {
                    info!(run_id = %run.id, step_id = %step.id, "Condition not met, skipping step");
                    let now = Utc::now();
                    run.step_results.insert(
                        step.id.clone(),
                        WorkflowStepResult {
                            status: StepStatus::Skipped,
                            started_at: Some(now),
                            completed_at: Some(now),
                            ..Default::default()
                        },
                    );
                }
            }
            self.persist(run, board)?;

            let snapshot = board.clone();
            let run_id = run.id.clone();
            let results = join_all(
                runnable
                    .iter()
                    .map(|step| self.execute_step(&run_id, step, &snapshot)),
            )
            .await;
            for (step, mut result) in runnable.iter().zip(results) {
                result.attempts = 1;
                self.apply(run, board, step, result);
            }
            self.persist(run, board)?;

            // One retry per failed step per pass, sequentially
            for step in runnable.iter().filter(|s| s.retries > 0) {
                let failed = run
                    .step(&step.id)
                    .is_some_and(|r| r.status == StepStatus::Error);
                if !failed {
                    continue;
                }
                warn!(run_id = %run.id, step_id = %step.id, "Retrying failed step");
                let mut result = self.execute_step(&run_id, step, board).await;
                result.attempts = 2;
                self.apply(run, board, step, result);
                self.persist(run, board)?;
            }

            let failed: Vec<&str> = layer
                .iter()
                .filter(|s| {
                    run.step(&s.id)
                        .is_some_and(|r| r.status == StepStatus::Error)
                })
                .map(|s| s.id.as_str())
                .collect();
            if !failed.is_empty() {
                error!(run_id = %run.id, steps = ?failed, "Workflow step failed, aborting run");
                run.status = RunStatus::Error;
                break;
            }
        }
        Ok(())
    }

    /// Best effort to leave a terminal record when the store failed mid-run:
    /// running steps and the run itself become errors.
    fn abandon(&self, run: &mut WorkflowRun, board: &RunBlackboard, cause: &ConclaveError) {
        error!(run_id = %run.id, error = %cause, "Workflow run aborted by store failure");
        let now = Utc::now();
        for result in run.step_results.values_mut() {
            if result.status == StepStatus::Running {
                result.status = StepStatus::Error;
                result.error = Some(cause.to_string());
                result.completed_at = Some(now);
            }
        }
        run.status = RunStatus::Error;
        run.completed_at = Some(now);
        if let Err(e) = self
            .persist(run, board)
            .and_then(|_| self.store.record_last_run(&run.workflow_id, run))
        {
            warn!(run_id = %run.id, error = %e, "Failed to record aborted run");
        }
    }

    /// Launch one step and wait for its stream, bounded by the step timeout.
    /// Never fails: every problem becomes an `error` result.
    async fn execute_step(
        &self,
        run_id: &str,
        step: &WorkflowStep,
        board: &RunBlackboard,
    ) -> WorkflowStepResult {
        let mut result = WorkflowStepResult {
            status: StepStatus::Running,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let prompt = interpolate(&step.prompt, board);
        let timeout = step
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let launched = match self.launch_step(run_id, step, &prompt).await {
            Ok(launched) => launched,
            Err(e) => {
                error!(run_id = %run_id, step_id = %step.id, error = %e, "Step launch failed");
                result.status = StepStatus::Error;
                result.error = Some(e.to_string());
                result.completed_at = Some(Utc::now());
                return result;
            }
        };
        result.trace_id = Some(launched.trace_id.clone());
        let handle = launched.handle.clone();

        match tokio::time::timeout(timeout, launched.collect()).await {
            Ok(outcome) => match outcome.error {
                Some(message) => {
                    warn!(run_id = %run_id, step_id = %step.id, error = %message, "Step failed");
                    result.status = StepStatus::Error;
                    result.error = Some(message);
                    if !outcome.text.is_empty() {
                        result.output = Some(outcome.text);
                    }
                }
                None => {
                    result.status = StepStatus::Completed;
                    result.output = Some(outcome.text);
                }
            },
            Err(_) => {
                warn!(
                    run_id = %run_id,
                    step_id = %step.id,
                    timeout_secs = timeout.as_secs(),
                    "Step timed out"
                );
                result.status = StepStatus::Error;
                result.error = Some(STEP_TIMED_OUT.to_string());
                if let Err(e) = self.launcher.stop_launch(&step.agent_id, &handle).await {
                    warn!(step_id = %step.id, error = %e, "Failed to stop timed out agent");
                }
            }
        }
        result.completed_at = Some(Utc::now());
        result
    }

    async fn launch_step(
        &self,
        run_id: &str,
        step: &WorkflowStep,
        prompt: &str,
    ) -> Result<crate::launcher::LaunchedRun> {
        let agent = self
            .launcher
            .ensure_agent(&step.agent_id, step.runtime.as_deref())?;
        self.launcher
            .start(&agent.id, prompt, LaunchOptions::for_step(run_id, &step.id))
            .await
    }

    fn apply(
        &self,
        run: &mut WorkflowRun,
        board: &mut RunBlackboard,
        step: &WorkflowStep,
        result: WorkflowStepResult,
    ) {
        if result.status == StepStatus::Completed {
            if let (Some(key), Some(output)) = (&step.output_key, &result.output) {
                board.set_str(key.clone(), output.clone());
            }
        }
        run.step_results.insert(step.id.clone(), result);
    }

    fn persist(&self, run: &mut WorkflowRun, board: &RunBlackboard) -> Result<()> {
        run.blackboard = board.data().clone();
        self.store.save_run(run)?;
        self.progress.publish(Progress::RunUpdated { run: run.clone() });
        Ok(())
    }
}

/// Whether a step's condition allows it to run. Unparseable conditions run.
fn should_run(step: &WorkflowStep, board: &RunBlackboard) -> bool {
    let Some(condition) = step.condition.as_deref() else {
        return true;
    };
    match evaluate_condition(condition, board) {
        Ok(satisfied) => satisfied,
        Err(e) => {
            warn!(
                step_id = %step.id,
                condition = %condition,
                error = %e,
                "Unparseable step condition, running step"
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_steps() {
        let ok = vec![
            WorkflowStep::new("a", "w", "x"),
            WorkflowStep::new("b", "w", "y").depends_on(&["a"]),
        ];
        assert!(validate_steps(&ok).is_ok());

        let dup = vec![WorkflowStep::new("a", "w", "x"), WorkflowStep::new("a", "w", "y")];
        assert!(matches!(validate_steps(&dup), Err(ConclaveError::InvalidWorkflow(_))));

        let dangling = vec![WorkflowStep::new("a", "w", "x").depends_on(&["ghost"])];
        assert!(matches!(validate_steps(&dangling), Err(ConclaveError::InvalidWorkflow(_))));

        let empty = vec![WorkflowStep::new(" ", "w", "x")];
        assert!(validate_steps(&empty).is_err());

        let cycle = vec![
            WorkflowStep::new("a", "w", "x").depends_on(&["b"]),
            WorkflowStep::new("b", "w", "y").depends_on(&["a"]),
        ];
        assert!(validate_steps(&cycle).is_ok());
    }

    #[test]
    fn test_should_run() {
        let board = RunBlackboard::new();
        assert!(should_run(&WorkflowStep::new("a", "w", ""), &board));
        assert!(!should_run(
            &WorkflowStep::new("a", "w", "").with_condition("missingKey"),
            &board
        ));
        assert!(should_run(
            &WorkflowStep::new("a", "w", "").with_condition("x ==="),
            &board
        ));
    }
}
