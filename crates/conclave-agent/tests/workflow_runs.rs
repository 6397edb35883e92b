use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conclave_agent::{run_webhook, BackendRegistry, Conclave, STEP_TIMED_OUT};
use conclave_core::config::AppConfig;
use conclave_core::error::ConclaveError;
use conclave_core::progress::Progress;
use conclave_core::types::{
    AgentStatus, NewWorkflow, RunStatus, StepStatus, WorkflowStep, WorkflowTrigger,
};
use conclave_store::Stores;
use conclave_test_utils::{Script, ScriptedBackend};
use tokio_util::sync::CancellationToken;

fn conclave(backend: Arc<ScriptedBackend>) -> Conclave {
    let mut registry = BackendRegistry::new("scripted");
    registry.register(backend);
    Conclave::with_stores(AppConfig::default(), Stores::in_memory().unwrap(), registry).unwrap()
}

fn pipeline() -> NewWorkflow {
    let mut spec = NewWorkflow::new(
        "review pipeline",
        vec![
            WorkflowStep::new("draft", "writer", "Write about {{topic}}").with_output_key("draft"),
            WorkflowStep::new("review", "reviewer", "Review: {{draft}}")
                .depends_on(&["draft"])
                .with_output_key("verdict"),
            WorkflowStep::new("publish", "publisher", "Publish {{draft}}")
                .depends_on(&["review"])
                .with_condition("verdict"),
        ],
    );
    spec.id = Some("pipeline".into());
    spec
}

#[tokio::test]
async fn steps_run_in_dependency_order_and_share_outputs() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    backend.push("writer", Script::reply("hello"));
    backend.push("reviewer", Script::reply("approved"));
    backend.push("publisher", Script::reply("shipped"));
    let app = conclave(backend.clone());
    app.engine.create_workflow(pipeline()).unwrap();

    let run = app
        .engine
        .run_workflow("pipeline", Some(json!({ "topic": "rust" })))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    for step in ["draft", "review", "publish"] {
        let result = run.step(step).unwrap();
        assert_eq!(result.status, StepStatus::Completed, "{}", step);
        assert_eq!(result.attempts, 1);
        assert!(result.trace_id.is_some());
    }
    assert_eq!(run.blackboard["verdict"], "approved");
    assert_eq!(backend.requests_for("writer")[0].prompt, "Write about rust");
    assert_eq!(backend.requests_for("reviewer")[0].prompt, "Review: hello");

    // Persisted and recorded on the definition
    let stored = app.engine.get_run(&run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.step_results, run.step_results);
    let workflow = app.engine.get_workflow("pipeline").unwrap();
    assert_eq!(workflow.last_run_status, Some(RunStatus::Completed));

    // Ephemeral agents were created and settled
    let writer = app.launcher.get_agent("writer").unwrap();
    assert_eq!(writer.status, AgentStatus::Idle);
}

#[tokio::test]
async fn failed_step_without_retries_aborts_run() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    backend.push("writer", Script::reply("hello"));
    backend.push("reviewer", Script::fail("model overloaded"));
    let app = conclave(backend.clone());
    app.engine.create_workflow(pipeline()).unwrap();

    let run = app.engine.run_workflow("pipeline", None).await.unwrap();

    assert_eq!(run.status, RunStatus::Error);
    let review = run.step("review").unwrap();
    assert_eq!(review.status, StepStatus::Error);
    assert!(review.error.as_deref().unwrap().contains("model overloaded"));
    assert_eq!(run.step("publish").unwrap().status, StepStatus::Pending);
    assert!(backend.requests_for("publisher").is_empty());
    assert_eq!(
        app.engine.get_workflow("pipeline").unwrap().last_run_status,
        Some(RunStatus::Error)
    );
}

#[tokio::test]
async fn unmet_condition_skips_without_running() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    let app = conclave(backend.clone());
    let mut spec = NewWorkflow::new(
        "gated",
        vec![WorkflowStep::new("deploy", "deployer", "deploy").with_condition("approved == true")],
    );
    spec.id = Some("gated".into());
    app.engine.create_workflow(spec).unwrap();
    let mut progress = app.progress.subscribe();

    let run = app
        .engine
        .run_workflow("gated", Some(json!({ "approved": false })))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step("deploy").unwrap().status, StepStatus::Skipped);
    assert!(backend.requests().is_empty());

    let mut updates = 0;
    while let Ok(event) = progress.try_recv() {
        if let Progress::RunUpdated { run } = event {
            updates += 1;
            assert_ne!(run.step("deploy").unwrap().status, StepStatus::Running);
        }
    }
    assert!(updates >= 2);
}

#[tokio::test]
async fn hung_step_times_out() {
    let backend = Arc::new(ScriptedBackend::new("scripted").with_default(Script::hang()));
    let app = conclave(backend);
    let mut spec = NewWorkflow::new(
        "slow",
        vec![WorkflowStep::new("wait", "sleeper", "wait forever").with_timeout(1)],
    );
    spec.id = Some("slow".into());
    app.engine.create_workflow(spec).unwrap();

    let run = app.engine.run_workflow("slow", None).await.unwrap();

    assert_eq!(run.status, RunStatus::Error);
    let wait = run.step("wait").unwrap();
    assert_eq!(wait.status, StepStatus::Error);
    assert_eq!(wait.error.as_deref(), Some(STEP_TIMED_OUT));
    assert_eq!(
        app.launcher.get_agent("sleeper").unwrap().status,
        AgentStatus::Terminated
    );
}

#[tokio::test]
async fn parallel_steps_share_one_agent() {
    let backend = Arc::new(
        ScriptedBackend::new("scripted")
            .with_default(Script::reply("done").with_delay(Duration::from_millis(100))),
    );
    let app = conclave(backend.clone());
    let mut spec = NewWorkflow::new(
        "fanout",
        vec![
            WorkflowStep::new("a", "worker", "first half"),
            WorkflowStep::new("b", "worker", "second half"),
        ],
    );
    spec.id = Some("fanout".into());
    app.engine.create_workflow(spec).unwrap();

    let run = app.engine.run_workflow("fanout", None).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    for step in ["a", "b"] {
        let result = run.step(step).unwrap();
        assert_eq!(result.status, StepStatus::Completed, "{}", step);
        assert_eq!(result.output.as_deref(), Some("done"));
        assert!(result.error.is_none());
    }
    assert_eq!(backend.requests_for("worker").len(), 2);
    assert_eq!(
        app.launcher.get_agent("worker").unwrap().status,
        AgentStatus::Idle
    );
}

#[tokio::test]
async fn step_timeout_spares_sibling_on_same_agent() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    // Launch order follows step order within a layer
    backend.push("worker", Script::hang());
    backend.push("worker", Script::reply("done").with_delay(Duration::from_millis(1500)));
    let app = conclave(backend.clone());
    let mut spec = NewWorkflow::new(
        "mixed",
        vec![
            WorkflowStep::new("stuck", "worker", "wait forever").with_timeout(1),
            WorkflowStep::new("slow", "worker", "take your time").with_timeout(10),
        ],
    );
    spec.id = Some("mixed".into());
    app.engine.create_workflow(spec).unwrap();

    let run = app.engine.run_workflow("mixed", None).await.unwrap();

    let stuck = run.step("stuck").unwrap();
    assert_eq!(stuck.status, StepStatus::Error);
    assert_eq!(stuck.error.as_deref(), Some(STEP_TIMED_OUT));
    let slow = run.step("slow").unwrap();
    assert_eq!(slow.status, StepStatus::Completed);
    assert_eq!(slow.output.as_deref(), Some("done"));
    assert_eq!(run.status, RunStatus::Error);
}

#[tokio::test]
async fn store_failure_mid_run_leaves_error_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conclave.db");
    let backend = Arc::new(ScriptedBackend::new("scripted").with_default(Script::reply("ok")));
    let mut registry = BackendRegistry::new("scripted");
    registry.register(backend.clone());
    let app =
        Conclave::with_stores(AppConfig::default(), Stores::open(&path).unwrap(), registry).unwrap();
    let mut spec = NewWorkflow::new("one", vec![WorkflowStep::new("only", "worker", "go")]);
    spec.id = Some("one".into());
    app.engine.create_workflow(spec).unwrap();

    // The first save of a run succeeds, later saves while it is running fail
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER fail_running_saves BEFORE INSERT ON workflow_runs
         WHEN NEW.status = 'running'
          AND EXISTS (SELECT 1 FROM workflow_runs WHERE id = NEW.id)
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
    )
    .unwrap();

    assert!(app.engine.run_workflow("one", None).await.is_err());

    let runs = app.engine.list_runs("one", 10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Error);
    assert!(runs[0].completed_at.is_some());
    let only = runs[0].step("only").unwrap();
    assert_eq!(only.status, StepStatus::Error);
    assert!(only.error.as_deref().unwrap().contains("disk I/O error"));
    assert!(backend.requests().is_empty());
    assert_eq!(
        app.engine.get_workflow("one").unwrap().last_run_status,
        Some(RunStatus::Error)
    );
}

#[tokio::test]
async fn failed_step_is_retried_once() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    backend.push("flaky", Script::fail("transient"));
    backend.push("flaky", Script::reply("second time lucky"));
    let app = conclave(backend.clone());
    let mut spec = NewWorkflow::new(
        "retry",
        vec![WorkflowStep::new("try", "flaky", "go")
            .with_retries(3)
            .with_output_key("out")],
    );
    spec.id = Some("retry".into());
    app.engine.create_workflow(spec).unwrap();

    let run = app.engine.run_workflow("retry", None).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    let result = run.step("try").unwrap();
    assert_eq!(result.status, StepStatus::Completed);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.output.as_deref(), Some("second time lucky"));
    assert_eq!(backend.requests_for("flaky").len(), 2);
}

#[tokio::test]
async fn invalid_definitions_are_rejected() {
    let app = conclave(Arc::new(ScriptedBackend::new("scripted")));
    let dangling = NewWorkflow::new(
        "broken",
        vec![WorkflowStep::new("a", "w", "x").depends_on(&["missing"])],
    );
    assert!(matches!(
        app.engine.create_workflow(dangling),
        Err(ConclaveError::InvalidWorkflow(_))
    ));
    assert!(app
        .engine
        .run_workflow("nope", None)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn event_trigger_consumes_each_event_once() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    let app = conclave(backend.clone());
    let mut spec = NewWorkflow::new(
        "on build",
        vec![WorkflowStep::new("notify", "notifier", "Built {{event.payload.branch}}")],
    );
    spec.id = Some("on-build".into());
    spec.trigger = WorkflowTrigger::Event {
        pattern: "build.*".into(),
    };
    app.engine.create_workflow(spec).unwrap();
    app.stores
        .events
        .publish("build.done", "ci", json!({ "branch": "main" }))
        .unwrap();
    app.stores
        .events
        .publish("deploy.done", "ci", json!({}))
        .unwrap();

    let scheduler = app.scheduler(CancellationToken::new());
    let started = scheduler.poll_events_once().unwrap();
    assert_eq!(started.len(), 1);
    for handle in started {
        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
    assert_eq!(backend.requests_for("notifier")[0].prompt, "Built main");

    assert!(scheduler.poll_events_once().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_requires_webhook_trigger() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    let app = conclave(backend.clone());
    let mut hook = NewWorkflow::new(
        "hook",
        vec![WorkflowStep::new("echo", "echoer", "Got {{webhook.ref}}")],
    );
    hook.id = Some("hook".into());
    hook.trigger = WorkflowTrigger::Webhook;
    app.engine.create_workflow(hook).unwrap();
    app.engine.create_workflow(pipeline()).unwrap();

    let run = run_webhook(&app.engine, "hook", json!({ "ref": "v1.2" }))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(backend.requests_for("echoer")[0].prompt, "Got v1.2");

    assert!(matches!(
        run_webhook(&app.engine, "pipeline", json!({})).await,
        Err(ConclaveError::InvalidWorkflow(_))
    ));
}
