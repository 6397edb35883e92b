use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{Workflow, WorkflowRun, WorkflowStatus, WorkflowTrigger};
use conclave_store::EventBus;

use crate::workflow::WorkflowEngine;

/// How many matching events one poll claims per workflow.
const EVENT_BATCH: usize = 50;

/// Upper bound on a cron sleep, so new or edited definitions get picked up.
const CRON_REFRESH: Duration = Duration::from_secs(60);

/// Starts workflows from their cron and event triggers.
///
/// Definitions are re-read on every tick; disabled workflows never fire.
pub struct WorkflowScheduler {
    engine: WorkflowEngine,
    events: EventBus,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl WorkflowScheduler {
    pub fn new(
        engine: WorkflowEngine,
        events: EventBus,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            events,
            poll_interval,
            cancel,
        }
    }

    /// Run both trigger loops. Returns when cancelled.
    pub async fn run(&self) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            "Workflow scheduler started"
        );
        tokio::join!(self.cron_loop(), self.event_loop());
        info!("Workflow scheduler shutting down");
    }

    async fn event_loop(&self) {
        loop {
            match self.poll_events_once() {
                Ok(started) if !started.is_empty() => {
                    debug!(count = started.len(), "Event triggers fired");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Event trigger poll failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Claim unconsumed events matching each event-triggered workflow and
    /// start one run per claimed event, oldest first. The event lands on the
    /// run blackboard under `event`.
    pub fn poll_events_once(&self) -> Result<Vec<JoinHandle<Result<WorkflowRun>>>> {
        let mut started = Vec::new();
        for workflow in self.active_workflows()? {
            let WorkflowTrigger::Event { pattern } = &workflow.trigger else {
                continue;
            };
            let mut matched = self.events.match_events(pattern, EVENT_BATCH)?;
            matched.reverse();
            for event in matched {
                // Another poller may have claimed it first
                if !self.events.consume(&event.id)? {
                    continue;
                }
                info!(
                    workflow_id = %workflow.id,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Event trigger fired"
                );
                started.push(self.spawn_run(&workflow.id, json!({ "event": event })));
            }
        }
        Ok(started)
    }

    async fn cron_loop(&self) {
        loop {
            let now = Utc::now();
            let next = match self.active_workflows() {
                Ok(workflows) => next_cron_fire(&workflows, now),
                Err(e) => {
                    error!(error = %e, "Failed to load workflows for cron triggers");
                    None
                }
            };
            let delay = match &next {
                Some((at, _)) => (*at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(CRON_REFRESH),
                None => CRON_REFRESH,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }

            if let Some((at, workflow_id)) = next {
                if Utc::now() >= at {
                    info!(workflow_id = %workflow_id, fire_at = %at.format("%H:%M:%S"), "Cron trigger fired");
                    self.spawn_run(&workflow_id, json!({ "trigger": "cron", "fired_at": at }));
                }
            }
        }
    }

    fn active_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self
            .engine
            .list_workflows()?
            .into_iter()
            .filter(|w| w.status == WorkflowStatus::Active)
            .collect())
    }

    fn spawn_run(&self, workflow_id: &str, input: serde_json::Value) -> JoinHandle<Result<WorkflowRun>> {
        let engine = self.engine.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            let result = engine.run_workflow(&workflow_id, Some(input)).await;
            if let Err(e) = &result {
                error!(workflow_id = %workflow_id, error = %e, "Triggered workflow run failed");
            }
            result
        })
    }
}

/// Reject triggers that could never fire.
pub fn validate_trigger(trigger: &WorkflowTrigger) -> Result<()> {
    match trigger {
        WorkflowTrigger::Cron { schedule } => Schedule::from_str(schedule)
            .map(|_| ())
            .map_err(|e| ConclaveError::InvalidWorkflow(format!("invalid cron '{}': {}", schedule, e))),
        WorkflowTrigger::Event { pattern } if pattern.trim().is_empty() => Err(
            ConclaveError::InvalidWorkflow("event trigger needs a pattern".into()),
        ),
        _ => Ok(()),
    }
}

/// Earliest upcoming cron fire across workflows. Invalid expressions are
/// skipped with a warning.
pub fn next_cron_fire(workflows: &[Workflow], after: DateTime<Utc>) -> Option<(DateTime<Utc>, String)> {
    workflows
        .iter()
        .filter_map(|w| match &w.trigger {
            WorkflowTrigger::Cron { schedule } => match Schedule::from_str(schedule) {
                Ok(parsed) => parsed.after(&after).next().map(|at| (at, w.id.clone())),
                Err(e) => {
                    warn!(
                        workflow_id = %w.id,
                        schedule = %schedule,
                        error = %e,
                        "Invalid cron expression, skipping workflow"
                    );
                    None
                }
            },
            _ => None,
        })
        .min_by_key(|(at, _)| *at)
}

/// Run a webhook-triggered workflow with the request body as input.
pub async fn run_webhook(
    engine: &WorkflowEngine,
    workflow_id: &str,
    payload: serde_json::Value,
) -> Result<WorkflowRun> {
    let workflow = engine.get_workflow(workflow_id)?;
    if workflow.trigger != WorkflowTrigger::Webhook {
        return Err(ConclaveError::InvalidWorkflow(format!(
            "workflow '{}' is not webhook-triggered",
            workflow_id
        )));
    }
    if workflow.status != WorkflowStatus::Active {
        return Err(ConclaveError::InvalidWorkflow(format!(
            "workflow '{}' is disabled",
            workflow_id
        )));
    }
    info!(workflow_id = %workflow_id, "Webhook trigger fired");
    engine
        .run_workflow(workflow_id, Some(json!({ "webhook": payload })))
        .await
}
