use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use conclave_agent::{run_webhook, ToolRequest, ToolResponse};
use conclave_core::error::ConclaveError;
use conclave_core::types::{EventQuery, NewAgent, NewTeam, NewWorkflow};

use crate::state::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

/// A failed request: status code plus a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl From<ConclaveError> for ApiError {
    fn from(e: ConclaveError) -> Self {
        let status = match &e {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            ConclaveError::AlreadyExists(_) => StatusCode::CONFLICT,
            ConclaveError::InvalidWorkflow(_)
            | ConclaveError::ToolValidation(_)
            | ConclaveError::UnknownRuntime(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

/// Optional JSON body: empty means `None`.
fn optional_body(body: &Bytes) -> Result<Option<Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", e)))
}

fn to_json<T: serde::Serialize>(value: T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Agents ──────────────────────────────────────────────────────

// GET /api/agents
pub async fn list_agents(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(json!({ "agents": state.app.launcher.list_agents()? }))
}

// POST /api/agents
pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewAgent>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let agent = state.app.launcher.create_agent(body)?;
    Ok((StatusCode::CREATED, to_json(agent)?))
}

// GET /api/agents/{id}
pub async fn get_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    to_json(state.app.launcher.get_agent(&id)?)
}

// DELETE /api/agents/{id}
pub async fn delete_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let deleted = state.app.launcher.delete_agent(&id).await?;
    if !deleted {
        return Err(ConclaveError::AgentNotFound(id).into());
    }
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub struct LaunchBody {
    pub prompt: String,
    /// Continue the stored session instead of starting fresh.
    #[serde(default)]
    pub resume: bool,
}

// POST /api/agents/{id}/launch: waits for the turn to finish
pub async fn launch_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<LaunchBody>,
) -> ApiResult {
    if body.prompt.is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "prompt is empty".into()));
    }
    let launcher = &state.app.launcher;
    let launched = if body.resume {
        launcher.prompt(&id, &body.prompt).await?
    } else {
        launcher.launch(&id, &body.prompt).await?
    };
    let trace_id = launched.trace_id.clone();
    let outcome = launched.collect().await;
    Ok(Json(json!({
        "agent_id": id,
        "trace_id": trace_id,
        "text": outcome.text,
        "error": outcome.error,
    })))
}

// POST /api/agents/{id}/stop
pub async fn stop_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let interrupted = state.app.launcher.stop(&id).await?;
    Ok(Json(json!({ "stopped": true, "interrupted": interrupted })))
}

// GET /api/agents/{id}/logs
pub async fn agent_logs(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.app.launcher.get_agent(&id)?;
    Ok(Json(json!({ "lines": state.app.launcher.logs(&id) })))
}

// POST /api/tools/{agent_id}: one coordination tool call on behalf of an agent
pub async fn call_tool(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<ToolRequest>,
) -> Json<ToolResponse> {
    Json(state.app.tools.handle(&agent_id, request).await)
}

// ── Workflows ───────────────────────────────────────────────────

// GET /api/workflows
pub async fn list_workflows(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(json!({ "workflows": state.app.engine.list_workflows()? }))
}

// POST /api/workflows
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewWorkflow>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let workflow = state.app.engine.create_workflow(body)?;
    info!(workflow_id = %workflow.id, "Workflow created via gateway");
    Ok((StatusCode::CREATED, to_json(workflow)?))
}

// GET /api/workflows/{id}
pub async fn get_workflow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    to_json(state.app.engine.get_workflow(&id)?)
}

// DELETE /api/workflows/{id}
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    if !state.app.engine.delete_workflow(&id)? {
        return Err(ConclaveError::WorkflowNotFound(id).into());
    }
    Ok(Json(json!({ "deleted": true })))
}

// POST /api/workflows/{id}/run: body is the run input; waits for the run
pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let input = optional_body(&body)?;
    to_json(state.app.engine.run_workflow(&id, input).await?)
}

// GET /api/workflows/{id}/runs?limit=50
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult {
    state.app.engine.get_workflow(&id)?;
    to_json(json!({ "runs": state.app.engine.list_runs(&id, q.limit)? }))
}

// GET /api/runs/{id}
pub async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    to_json(state.app.engine.get_run(&id)?)
}

/// POST /api/hooks/workflows/{id}: runs a webhook-triggered workflow with
/// the request body as input. Requires `Bearer <gateway.webhook_token>`
/// when a token is configured.
pub async fn workflow_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if let Some(expected) = &state.config.webhook_token {
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if token != Some(expected.as_str()) {
            warn!(workflow_id = %id, "Rejected webhook with bad token");
            return Err(ApiError(StatusCode::UNAUTHORIZED, "invalid webhook token".into()));
        }
    }
    let payload = optional_body(&body)?.unwrap_or(Value::Null);
    to_json(run_webhook(&state.app.engine, &id, payload).await?)
}

// ── Teams ───────────────────────────────────────────────────────

// GET /api/teams
pub async fn list_teams(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(json!({ "teams": state.app.teams.list_teams()? }))
}

// POST /api/teams
pub async fn create_team(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTeam>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let team = state.app.teams.create_team(body)?;
    Ok((StatusCode::CREATED, to_json(team)?))
}

// GET /api/teams/{id}/status
pub async fn team_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    to_json(state.app.teams.team_status(&id)?)
}

#[derive(Deserialize)]
pub struct StartTeamBody {
    pub prompt: String,
}

// POST /api/teams/{id}/start: returns once the supervisor is launched
pub async fn start_team(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StartTeamBody>,
) -> ApiResult {
    let mut events = state.app.teams.start_team(&id, &body.prompt).await?;
    // Drain in the background; delegations are published as they stream
    tokio::spawn(async move { while events.next().await.is_some() {} });
    Ok(Json(json!({ "started": true, "team_id": id })))
}

// POST /api/teams/{id}/stop
pub async fn stop_team(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    to_json(state.app.teams.stop_team(&id).await?)
}

// ── Events and traces ───────────────────────────────────────────

// GET /api/events?type=&source=&unconsumed_only=&limit=
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventQuery>,
) -> ApiResult {
    to_json(json!({ "events": state.app.stores.events.query(&query)? }))
}

#[derive(Deserialize)]
pub struct TraceQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

// GET /api/traces?agent_id=&limit=
pub async fn list_traces(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TraceQuery>,
) -> ApiResult {
    let traces = state
        .app
        .stores
        .traces
        .list_traces(q.agent_id.as_deref(), q.limit)?;
    to_json(json!({ "traces": traces }))
}

// GET /api/traces/{id}
pub async fn get_trace(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let traces = &state.app.stores.traces;
    let trace = traces.get_trace(&id)?;
    let spans = traces.spans_for(&id)?;
    to_json(json!({ "trace": trace, "spans": spans }))
}
