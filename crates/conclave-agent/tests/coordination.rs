use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use serde_json::{json, Value};

use conclave_agent::{BackendRegistry, Conclave, ToolRequest, INTERRUPTED};
use conclave_core::config::AppConfig;
use conclave_core::types::{
    AgentStatus, BackendEvent, EventQuery, NewAgent, NewTeam, StreamEvent, TeamMember,
    TASK_DELEGATED,
};
use conclave_store::Stores;
use conclave_test_utils::{Script, ScriptedBackend};

fn conclave(backend: Arc<ScriptedBackend>) -> Conclave {
    let mut registry = BackendRegistry::new("scripted");
    registry.register(backend);
    Conclave::with_stores(AppConfig::default(), Stores::in_memory().unwrap(), registry).unwrap()
}

async fn call(app: &Conclave, agent_id: &str, method: &str, params: Value) -> Value {
    let response = app
        .tools
        .handle(
            agent_id,
            ToolRequest {
                id: None,
                method: method.into(),
                params,
            },
        )
        .await;
    match response.error {
        Some(e) => panic!("{} failed: {}", method, e.message),
        None => response.result.unwrap_or(Value::Null),
    }
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let app = conclave(Arc::new(ScriptedBackend::new("scripted")));
    app.stores
        .events
        .publish(TASK_DELEGATED, "lead", json!({ "task": "fix the build" }))
        .unwrap();

    let claims = (0..8).map(|i| {
        let app = app.clone();
        tokio::spawn(async move {
            call(&app, &format!("worker-{}", i), "claim_task", json!({})).await
        })
    });
    let results: Vec<Value> = join_all(claims)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r["claimed"] == true).count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn delegated_task_round_trip() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    backend.push(
        "lead",
        Script::events(vec![
            BackendEvent::Text("[DELEGATE: coder | implement the tokenizer]".into()),
            BackendEvent::Done { usage: None },
        ]),
    );
    let app = conclave(backend);
    app.launcher
        .create_agent(NewAgent::new("lead", "Lead"))
        .unwrap();
    app.teams
        .create_team(NewTeam {
            id: Some("compiler".into()),
            name: "Compiler".into(),
            supervisor_id: Some("lead".into()),
            members: vec![TeamMember::new("coder", "developer")],
            ..Default::default()
        })
        .unwrap();
    let mut progress = app.progress.subscribe();

    let events: Vec<StreamEvent> = app
        .teams
        .start_team("compiler", "Write a tokenizer")
        .await
        .unwrap()
        .collect()
        .await;
    assert!(events.last().unwrap().is_done());

    let mut delegated = false;
    while let Ok(event) = progress.try_recv() {
        if let conclave_core::progress::Progress::Delegated { delegation, .. } = event {
            assert_eq!(delegation.agent_id, "coder");
            delegated = true;
        }
    }
    assert!(delegated);

    // The member sees its team and claims the task
    let team = call(&app, "coder", "list_team", json!({})).await;
    assert_eq!(team["team"]["id"], "compiler");

    let claim = call(&app, "coder", "claim_task", json!({})).await;
    assert_eq!(claim["claimed"], true);
    assert_eq!(claim["task"]["payload"]["task"], "implement the tokenizer");
    assert_eq!(claim["task"]["payload"]["team_id"], "compiler");
    let task_id = claim["task"]["id"].as_str().unwrap().to_string();

    call(
        &app,
        "coder",
        "update_blackboard",
        json!({ "key": "tokenizer", "value": { "done": true } }),
    )
    .await;
    let done = call(
        &app,
        "coder",
        "complete_task",
        json!({ "task_id": task_id, "result": "merged" }),
    )
    .await;
    assert_eq!(done["completed"], true);

    let report = app.teams.team_status("compiler").unwrap();
    assert_eq!(report.blackboard.len(), 1);
    assert_eq!(report.blackboard[0].updated_by, "coder");
    assert!(report
        .recent_events
        .iter()
        .any(|e| e.event_type == "task.completed"));
    assert_eq!(
        app.stores
            .events
            .query(&EventQuery::of_type(TASK_DELEGATED))
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn direct_messages_are_read_once() {
    let app = conclave(Arc::new(ScriptedBackend::new("scripted")));
    call(&app, "alice", "send_message", json!({ "to": "bob", "message": "ping" })).await;
    call(&app, "alice", "send_message", json!({ "to": "carol", "message": "hi" })).await;

    let inbox = call(&app, "bob", "check_messages", json!({})).await;
    let messages = inbox["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["message"], "ping");
    assert_eq!(messages[0]["from"], "alice");

    let again = call(&app, "bob", "check_messages", json!({})).await;
    assert!(again["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn stop_interrupts_and_prompt_resumes() {
    let backend = Arc::new(ScriptedBackend::new("scripted"));
    backend.push(
        "solo",
        Script::events(vec![
            BackendEvent::SessionStarted {
                session_id: "sess-9".into(),
            },
            BackendEvent::Text("partial".into()),
        ])
        .then_hang(),
    );
    backend.push("solo", Script::reply("resumed"));
    let app = conclave(backend.clone());
    app.launcher
        .create_agent(NewAgent::new("solo", "Solo"))
        .unwrap();

    let mut run = app.launcher.launch("solo", "long task").await.unwrap();
    loop {
        let event = run.events.next().await.unwrap();
        if event.text() == Some("partial") {
            break;
        }
    }

    assert!(app.launcher.stop("solo").await.unwrap());
    let outcome = run.collect().await;
    assert_eq!(outcome.error.as_deref(), Some(INTERRUPTED));
    let agent = app.launcher.get_agent("solo").unwrap();
    assert_eq!(agent.status, AgentStatus::Terminated);
    assert_eq!(agent.session_id.as_deref(), Some("sess-9"));

    let outcome = app
        .launcher
        .prompt("solo", "carry on")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(outcome.text, "resumed");
    assert_eq!(
        backend.requests_for("solo")[1].resume_session.as_deref(),
        Some("sess-9")
    );
    assert_eq!(app.launcher.get_agent("solo").unwrap().status, AgentStatus::Idle);
    assert!(!app.launcher.logs("solo").is_empty());
}
