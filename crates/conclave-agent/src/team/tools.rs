use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{EventQuery, Team, GLOBAL_TEAM, TASK_DELEGATED};
use conclave_store::Stores;

/// Event type of agent-to-agent messages.
pub const DIRECT_MESSAGE: &str = "message.direct";
pub const TASK_COMPLETED: &str = "task.completed";
pub const HELP_REQUESTED: &str = "help.requested";

/// Who is calling, and the state they can reach.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub stores: Stores,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>, stores: Stores) -> Self {
        Self {
            agent_id: agent_id.into(),
            stores,
        }
    }

    /// The explicit team, else the first team the caller belongs to.
    fn team(&self, explicit: Option<&str>) -> Result<Option<Team>> {
        match explicit {
            Some(id) => self.stores.teams.get(id).map(Some),
            None => Ok(self.stores.teams.teams_of(&self.agent_id)?.into_iter().next()),
        }
    }

    /// Blackboard scope: explicit team, caller's team, or the global board.
    fn board_scope(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(id) = explicit {
            return Ok(id.to_string());
        }
        Ok(self
            .team(None)?
            .map(|t| t.id)
            .unwrap_or_else(|| GLOBAL_TEAM.to_string()))
    }
}

/// A coordination primitive callable by agents.
pub trait CoordinationTool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool input.
    fn input_schema(&self) -> Value;

    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The fixed coordination tool set.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn CoordinationTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl CoordinationTool) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CoordinationTool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| ConclaveError::ToolNotFound(name.to_string()))?;
        tool.execute(input, ctx).await
    }

    pub fn with_coordination_tools() -> Self {
        let mut registry = Self::new();

        // ── Events (2) ──────────────────────────────────────────
        registry.register(PublishEventTool);
        registry.register(CheckEventsTool);

        // ── Messages (2) ────────────────────────────────────────
        registry.register(SendMessageTool);
        registry.register(CheckMessagesTool);

        // ── Team (2) ────────────────────────────────────────────
        registry.register(ListTeamTool);
        registry.register(GetAgentProfileTool);

        // ── Blackboard (2) ──────────────────────────────────────
        registry.register(ReadBlackboardTool);
        registry.register(UpdateBlackboardTool);

        // ── Tasks (4) ───────────────────────────────────────────
        registry.register(ClaimTaskTool);
        registry.register(CompleteTaskTool);
        registry.register(RequestHelpTool);
        registry.register(DelegateTaskTool);

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_coordination_tools()
    }
}

fn parse<T: for<'de> Deserialize<'de>>(input: Value) -> Result<T> {
    // Tools without arguments may be called with null
    let input = if input.is_null() { json!({}) } else { input };
    serde_json::from_value(input).map_err(|e| ConclaveError::ToolValidation(e.to_string()))
}

fn default_limit() -> usize {
    20
}

fn default_true() -> bool {
    true
}

// ── PublishEventTool ────────────────────────────────────────────

pub struct PublishEventTool;

#[derive(Deserialize)]
struct PublishInput {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

impl CoordinationTool for PublishEventTool {
    fn name(&self) -> &str {
        "publish_event"
    }
    fn description(&self) -> &str {
        "Publish an event on the shared event bus."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": { "type": "string", "description": "Dot-namespaced event type, e.g. build.finished" },
                "payload": { "description": "Any JSON value" }
            },
            "required": ["type"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: PublishInput = parse(input)?;
            if params.event_type.trim().is_empty() {
                return Err(ConclaveError::ToolValidation("type must not be empty".into()));
            }
            let event = ctx
                .stores
                .events
                .publish(&params.event_type, &ctx.agent_id, params.payload)?;
            Ok(serde_json::to_value(event)?)
        })
    }
}

// ── CheckEventsTool ─────────────────────────────────────────────

pub struct CheckEventsTool;

#[derive(Deserialize)]
struct CheckEventsInput {
    #[serde(default, rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    include_consumed: bool,
    #[serde(default = "default_limit")]
    limit: usize,
}

impl CoordinationTool for CheckEventsTool {
    fn name(&self) -> &str {
        "check_events"
    }
    fn description(&self) -> &str {
        "List recent events, newest first. Only unconsumed events unless include_consumed is set."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": { "type": "string" },
                "source": { "type": "string" },
                "include_consumed": { "type": "boolean", "description": "Also show consumed events (default: false)" },
                "limit": { "type": "integer", "description": "Max events (default: 20)" }
            }
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: CheckEventsInput = parse(input)?;
            let query = EventQuery {
                event_type: params.event_type,
                source: params.source,
                unconsumed_only: !params.include_consumed,
                limit: params.limit,
            };
            let events = ctx.stores.events.query(&query)?;
            Ok(json!({ "events": events }))
        })
    }
}

// ── SendMessageTool ─────────────────────────────────────────────

pub struct SendMessageTool;

#[derive(Deserialize)]
struct SendInput {
    to: String,
    message: String,
}

impl CoordinationTool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }
    fn description(&self) -> &str {
        "Send a direct message to another agent."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Recipient agent id" },
                "message": { "type": "string" }
            },
            "required": ["to", "message"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: SendInput = parse(input)?;
            let event = ctx.stores.events.publish(
                DIRECT_MESSAGE,
                &ctx.agent_id,
                json!({ "to": params.to, "from": ctx.agent_id, "message": params.message }),
            )?;
            Ok(json!({ "sent": true, "event_id": event.id }))
        })
    }
}

// ── CheckMessagesTool ───────────────────────────────────────────

pub struct CheckMessagesTool;

#[derive(Deserialize)]
struct CheckMessagesInput {
    #[serde(default = "default_limit")]
    limit: usize,
    /// Consume returned messages so they are not delivered again.
    #[serde(default = "default_true")]
    mark_read: bool,
}

impl CoordinationTool for CheckMessagesTool {
    fn name(&self) -> &str {
        "check_messages"
    }
    fn description(&self) -> &str {
        "Read unread direct messages addressed to you, newest first."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max messages (default: 20)" },
                "mark_read": { "type": "boolean", "description": "Mark returned messages read (default: true)" }
            }
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: CheckMessagesInput = parse(input)?;
            let inbox: Vec<_> = ctx
                .stores
                .events
                .query(&EventQuery::of_type(DIRECT_MESSAGE).with_limit(500))?
                .into_iter()
                .filter(|e| e.payload.get("to").and_then(Value::as_str) == Some(ctx.agent_id.as_str()))
                .take(params.limit)
                .collect();
            if params.mark_read {
                for message in &inbox {
                    ctx.stores.events.consume(&message.id)?;
                }
            }
            let messages: Vec<Value> = inbox
                .iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "from": e.source,
                        "message": e.payload.get("message").cloned().unwrap_or(Value::Null),
                        "timestamp": e.timestamp,
                    })
                })
                .collect();
            Ok(json!({ "messages": messages }))
        })
    }
}

// ── ListTeamTool ────────────────────────────────────────────────

pub struct ListTeamTool;

#[derive(Deserialize)]
struct TeamInput {
    #[serde(default)]
    team_id: Option<String>,
}

impl CoordinationTool for ListTeamTool {
    fn name(&self) -> &str {
        "list_team"
    }
    fn description(&self) -> &str {
        "List the members of your team with their roles, capabilities and status."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "team_id": { "type": "string", "description": "Team id (default: your team)" }
            }
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: TeamInput = parse(input)?;
            let Some(team) = ctx.team(params.team_id.as_deref())? else {
                return Ok(json!({ "team": null, "members": [] }));
            };
            let mut members = Vec::new();
            for member in &team.members {
                let agent = ctx.stores.agents.find(&member.agent_id)?;
                members.push(json!({
                    "agent_id": member.agent_id,
                    "name": agent.as_ref().map(|a| a.name.as_str()),
                    "role": member.role,
                    "capabilities": member.capabilities,
                    "status": agent.as_ref().map(|a| a.status),
                }));
            }
            Ok(json!({
                "team": { "id": team.id, "name": team.name, "supervisor_id": team.supervisor_id },
                "members": members,
            }))
        })
    }
}

// ── GetAgentProfileTool ─────────────────────────────────────────

pub struct GetAgentProfileTool;

#[derive(Deserialize)]
struct ProfileInput {
    agent_id: String,
}

impl CoordinationTool for GetAgentProfileTool {
    fn name(&self) -> &str {
        "get_agent_profile"
    }
    fn description(&self) -> &str {
        "Look up an agent's name, status, capabilities and team roles."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "agent_id": { "type": "string" } },
            "required": ["agent_id"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: ProfileInput = parse(input)?;
            let agent = ctx.stores.agents.get(&params.agent_id)?;
            let roles: Vec<Value> = ctx
                .stores
                .teams
                .teams_of(&agent.id)?
                .iter()
                .map(|team| {
                    let role = match team.member(&agent.id) {
                        Some(m) => m.role.as_str(),
                        None => "supervisor",
                    };
                    json!({ "team_id": team.id, "role": role })
                })
                .collect();
            Ok(json!({
                "id": agent.id,
                "name": agent.name,
                "status": agent.status,
                "capabilities": agent.config.capabilities,
                "last_activity": agent.last_activity,
                "teams": roles,
            }))
        })
    }
}

// ── ReadBlackboardTool ──────────────────────────────────────────

pub struct ReadBlackboardTool;

#[derive(Deserialize)]
struct ReadBoardInput {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
}

impl CoordinationTool for ReadBlackboardTool {
    fn name(&self) -> &str {
        "read_blackboard"
    }
    fn description(&self) -> &str {
        "Read one key from the team blackboard, or every entry when no key is given."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "team_id": { "type": "string", "description": "Team scope (default: your team, else global)" }
            }
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: ReadBoardInput = parse(input)?;
            let scope = ctx.board_scope(params.team_id.as_deref())?;
            match params.key {
                Some(key) => {
                    let entry = ctx.stores.blackboard.read(&key, &scope)?;
                    Ok(json!({ "team_id": scope, "entry": entry }))
                }
                None => {
                    let entries = ctx.stores.blackboard.read_all(&scope)?;
                    Ok(json!({ "team_id": scope, "entries": entries }))
                }
            }
        })
    }
}

// ── UpdateBlackboardTool ────────────────────────────────────────

pub struct UpdateBlackboardTool;

#[derive(Deserialize)]
struct UpdateBoardInput {
    key: String,
    value: Value,
    #[serde(default)]
    team_id: Option<String>,
}

impl CoordinationTool for UpdateBlackboardTool {
    fn name(&self) -> &str {
        "update_blackboard"
    }
    fn description(&self) -> &str {
        "Write a value to the team blackboard. Returns the new version; last writer wins."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": { "description": "Any JSON value" },
                "team_id": { "type": "string", "description": "Team scope (default: your team, else global)" }
            },
            "required": ["key", "value"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: UpdateBoardInput = parse(input)?;
            if params.key.trim().is_empty() {
                return Err(ConclaveError::ToolValidation("key must not be empty".into()));
            }
            let scope = ctx.board_scope(params.team_id.as_deref())?;
            let entry = ctx
                .stores
                .blackboard
                .write(&params.key, &params.value, &ctx.agent_id, &scope)?;
            Ok(serde_json::to_value(entry)?)
        })
    }
}

// ── ClaimTaskTool ───────────────────────────────────────────────

pub struct ClaimTaskTool;

#[derive(Deserialize)]
struct ClaimInput {
    #[serde(default = "default_task_type", rename = "type")]
    event_type: String,
}

fn default_task_type() -> String {
    TASK_DELEGATED.to_string()
}

impl CoordinationTool for ClaimTaskTool {
    fn name(&self) -> &str {
        "claim_task"
    }
    fn description(&self) -> &str {
        "Claim the newest unclaimed task event of a type. At most one caller wins each task."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "type": { "type": "string", "description": "Task event type (default: task.delegated)" }
            }
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: ClaimInput = parse(input)?;
            match ctx.stores.events.claim_newest(&params.event_type)? {
                Some(task) => {
                    tracing::info!(agent_id = %ctx.agent_id, task_id = %task.id, "Task claimed");
                    Ok(json!({ "claimed": true, "task": task }))
                }
                None => Ok(json!({ "claimed": false })),
            }
        })
    }
}

// ── CompleteTaskTool ────────────────────────────────────────────

pub struct CompleteTaskTool;

#[derive(Deserialize)]
struct CompleteInput {
    task_id: String,
    #[serde(default)]
    result: Value,
}

impl CoordinationTool for CompleteTaskTool {
    fn name(&self) -> &str {
        "complete_task"
    }
    fn description(&self) -> &str {
        "Report a claimed task as done and publish its result."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string", "description": "Id of the claimed task event" },
                "result": { "description": "Outcome, any JSON value" }
            },
            "required": ["task_id"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: CompleteInput = parse(input)?;
            // Unknown task ids fail here
            ctx.stores.events.consume(&params.task_id)?;
            let event = ctx.stores.events.publish(
                TASK_COMPLETED,
                &ctx.agent_id,
                json!({ "task_id": params.task_id, "result": params.result }),
            )?;
            Ok(json!({ "completed": true, "event_id": event.id }))
        })
    }
}

// ── RequestHelpTool ─────────────────────────────────────────────

pub struct RequestHelpTool;

#[derive(Deserialize)]
struct HelpInput {
    message: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

impl CoordinationTool for RequestHelpTool {
    fn name(&self) -> &str {
        "request_help"
    }
    fn description(&self) -> &str {
        "Ask the team for help, optionally naming the capabilities needed."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "capabilities": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["message"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: HelpInput = parse(input)?;
            let team_id = ctx.team(None)?.map(|t| t.id);
            let event = ctx.stores.events.publish(
                HELP_REQUESTED,
                &ctx.agent_id,
                json!({
                    "message": params.message,
                    "capabilities": params.capabilities,
                    "team_id": team_id,
                }),
            )?;
            Ok(json!({ "requested": true, "event_id": event.id }))
        })
    }
}

// ── DelegateTaskTool ────────────────────────────────────────────

pub struct DelegateTaskTool;

#[derive(Deserialize)]
struct DelegateInput {
    agent_id: String,
    task: String,
}

impl CoordinationTool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }
    fn description(&self) -> &str {
        "Hand a task to another agent. It is published as a task.delegated event."
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string", "description": "Agent that should do the task" },
                "task": { "type": "string" }
            },
            "required": ["agent_id", "task"]
        })
    }
    fn execute(&self, input: Value, ctx: ToolContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let params: DelegateInput = parse(input)?;
            let team_id = ctx.team(None)?.map(|t| t.id);
            let event = ctx.stores.events.publish(
                TASK_DELEGATED,
                &ctx.agent_id,
                json!({
                    "agent_id": params.agent_id,
                    "task": params.task,
                    "from": ctx.agent_id,
                    "team_id": team_id,
                }),
            )?;
            Ok(json!({ "delegated": true, "event_id": event.id }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conclave_core::types::{AgentConfig, AgentInstance, AgentStatus, TeamMember, TeamStatus};

    fn ctx(agent_id: &str, stores: &Stores) -> ToolContext {
        ToolContext::new(agent_id, stores.clone())
    }

    fn seed_team(stores: &Stores) {
        for id in ["boss", "dev"] {
            stores
                .agents
                .insert(&AgentInstance {
                    id: id.into(),
                    name: id.to_uppercase(),
                    config: AgentConfig {
                        capabilities: vec!["rust".into()],
                        ..Default::default()
                    },
                    status: AgentStatus::Idle,
                    session_id: None,
                    started_at: None,
                    last_activity: None,
                    error: None,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        stores
            .teams
            .save(&Team {
                id: "core".into(),
                name: "Core".into(),
                description: String::new(),
                supervisor_id: Some("boss".into()),
                members: vec![TeamMember::new("dev", "developer")],
                status: TeamStatus::Idle,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn test_registry_has_fixed_tool_set() {
        let registry = ToolRegistry::with_coordination_tools();
        assert_eq!(
            registry.list(),
            vec![
                "check_events",
                "check_messages",
                "claim_task",
                "complete_task",
                "delegate_task",
                "get_agent_profile",
                "list_team",
                "publish_event",
                "read_blackboard",
                "request_help",
                "send_message",
                "update_blackboard",
            ]
        );
        assert!(registry
            .definitions()
            .iter()
            .all(|d| d.input_schema["type"] == "object"));
    }

    #[tokio::test]
    async fn test_messages_are_private_and_read_once() {
        let stores = Stores::in_memory().unwrap();
        let registry = ToolRegistry::default();

        registry
            .execute("send_message", json!({"to": "dev", "message": "ping"}), ctx("boss", &stores))
            .await
            .unwrap();
        registry
            .execute("send_message", json!({"to": "qa", "message": "other"}), ctx("boss", &stores))
            .await
            .unwrap();

        let inbox = registry
            .execute("check_messages", Value::Null, ctx("dev", &stores))
            .await
            .unwrap();
        let messages = inbox["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["from"], "boss");
        assert_eq!(messages[0]["message"], "ping");

        let again = registry
            .execute("check_messages", json!({}), ctx("dev", &stores))
            .await
            .unwrap();
        assert!(again["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blackboard_defaults_to_team_scope() {
        let stores = Stores::in_memory().unwrap();
        seed_team(&stores);
        let registry = ToolRegistry::default();

        let written = registry
            .execute("update_blackboard", json!({"key": "plan", "value": {"step": 1}}), ctx("dev", &stores))
            .await
            .unwrap();
        assert_eq!(written["team_id"], "core");
        assert_eq!(written["version"], 1);

        let written = registry
            .execute("update_blackboard", json!({"key": "plan", "value": {"step": 2}}), ctx("boss", &stores))
            .await
            .unwrap();
        assert_eq!(written["version"], 2);
        assert_eq!(written["updated_by"], "boss");

        let read = registry
            .execute("read_blackboard", json!({"key": "plan"}), ctx("dev", &stores))
            .await
            .unwrap();
        assert_eq!(read["entry"]["value"]["step"], 2);

        // An agent outside any team writes to the global board
        let global = registry
            .execute("update_blackboard", json!({"key": "plan", "value": 0}), ctx("loner", &stores))
            .await
            .unwrap();
        assert_eq!(global["team_id"], GLOBAL_TEAM);
        assert_eq!(global["version"], 1);
    }

    #[tokio::test]
    async fn test_claim_and_complete_task() {
        let stores = Stores::in_memory().unwrap();
        seed_team(&stores);
        let registry = ToolRegistry::default();

        let delegated = registry
            .execute("delegate_task", json!({"agent_id": "dev", "task": "fix bug"}), ctx("boss", &stores))
            .await
            .unwrap();
        let task_id = delegated["event_id"].as_str().unwrap().to_string();

        let claim = registry
            .execute("claim_task", json!({}), ctx("dev", &stores))
            .await
            .unwrap();
        assert_eq!(claim["claimed"], true);
        assert_eq!(claim["task"]["payload"]["task"], "fix bug");
        assert_eq!(claim["task"]["payload"]["team_id"], "core");

        let second = registry
            .execute("claim_task", json!({"type": TASK_DELEGATED}), ctx("boss", &stores))
            .await
            .unwrap();
        assert_eq!(second["claimed"], false);

        let done = registry
            .execute("complete_task", json!({"task_id": task_id, "result": "ok"}), ctx("dev", &stores))
            .await
            .unwrap();
        assert_eq!(done["completed"], true);
        let completions = stores.events.query(&EventQuery::of_type(TASK_COMPLETED)).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].source, "dev");
    }

    #[tokio::test]
    async fn test_profile_and_team_listing() {
        let stores = Stores::in_memory().unwrap();
        seed_team(&stores);
        let registry = ToolRegistry::default();

        let profile = registry
            .execute("get_agent_profile", json!({"agent_id": "boss"}), ctx("dev", &stores))
            .await
            .unwrap();
        assert_eq!(profile["name"], "BOSS");
        assert_eq!(profile["teams"][0]["role"], "supervisor");

        let team = registry
            .execute("list_team", json!({}), ctx("dev", &stores))
            .await
            .unwrap();
        assert_eq!(team["team"]["id"], "core");
        assert_eq!(team["members"][0]["role"], "developer");
        assert_eq!(team["members"][0]["status"], "idle");
    }

    #[tokio::test]
    async fn test_validation_and_unknown_tool() {
        let stores = Stores::in_memory().unwrap();
        let registry = ToolRegistry::default();

        assert!(matches!(
            registry.execute("send_message", json!({"to": 3}), ctx("a", &stores)).await,
            Err(ConclaveError::ToolValidation(_))
        ));
        assert!(matches!(
            registry.execute("teleport", json!({}), ctx("a", &stores)).await,
            Err(ConclaveError::ToolNotFound(_))
        ));
        assert!(registry
            .execute("get_agent_profile", json!({"agent_id": "ghost"}), ctx("a", &stores))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
