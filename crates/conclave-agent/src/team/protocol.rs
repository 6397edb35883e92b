//! Request/response envelope for the coordination tools.
//!
//! A request names either a tool directly (`{"method": "claim_task", ...}`)
//! or goes through `tools/call` with `{"name", "arguments"}`. `tools/list`
//! returns the tool definitions. Over stdio the envelope is one JSON object
//! per line.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_store::Stores;

use super::tools::{ToolContext, ToolRegistry};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const NOT_FOUND: i64 = -32004;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ToolError {
                code,
                message: message.into(),
            }),
        }
    }
}

fn error_code(e: &ConclaveError) -> i64 {
    match e {
        ConclaveError::ToolNotFound(_) => METHOD_NOT_FOUND,
        ConclaveError::ToolValidation(_) => INVALID_PARAMS,
        e if e.is_not_found() => NOT_FOUND,
        _ => SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Serves coordination tool calls on behalf of agents.
#[derive(Clone)]
pub struct ToolServer {
    registry: Arc<ToolRegistry>,
    stores: Stores,
}

impl ToolServer {
    pub fn new(registry: Arc<ToolRegistry>, stores: Stores) -> Self {
        Self { registry, stores }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Handle one request made by `agent_id`. Failures become error responses.
    pub async fn handle(&self, agent_id: &str, request: ToolRequest) -> ToolResponse {
        let id = request.id.clone();
        match self.dispatch(agent_id, request).await {
            Ok(result) => ToolResponse::ok(id, result),
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "Tool call failed");
                ToolResponse::err(id, error_code(&e), e.to_string())
            }
        }
    }

    async fn dispatch(&self, agent_id: &str, request: ToolRequest) -> Result<Value> {
        let (name, arguments) = match request.method.as_str() {
            "tools/list" => return Ok(json!({ "tools": self.registry.definitions() })),
            "tools/call" => {
                let call: CallParams = serde_json::from_value(request.params)
                    .map_err(|e| ConclaveError::ToolValidation(e.to_string()))?;
                (call.name, call.arguments)
            }
            _ => (request.method, request.params),
        };
        debug!(agent_id = %agent_id, tool = %name, "Tool call");
        let ctx = ToolContext::new(agent_id, self.stores.clone());
        self.registry.execute(&name, arguments, ctx).await
    }

    /// Answer JSON-lines requests until the reader closes.
    pub async fn serve<R, W>(&self, agent_id: &str, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<ToolRequest>(&line) {
                Ok(request) => self.handle(agent_id, request).await,
                Err(e) => {
                    warn!(error = %e, "Malformed tool request");
                    ToolResponse::err(None, PARSE_ERROR, e.to_string())
                }
            };
            let mut out = serde_json::to_string(&response)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::types::EventQuery;

    fn server() -> ToolServer {
        ToolServer::new(
            Arc::new(ToolRegistry::with_coordination_tools()),
            Stores::in_memory().unwrap(),
        )
    }

    fn request(method: &str, params: Value) -> ToolRequest {
        ToolRequest {
            id: Some(json!(1)),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn test_direct_and_wrapped_calls() {
        let server = server();
        let direct = server
            .handle("a", request("publish_event", json!({"type": "build.done"})))
            .await;
        assert!(direct.error.is_none());
        assert_eq!(direct.result.unwrap()["source"], "a");

        let wrapped = server
            .handle(
                "b",
                request("tools/call", json!({"name": "check_events", "arguments": {"type": "build.done"}})),
            )
            .await;
        assert_eq!(wrapped.id, Some(json!(1)));
        assert_eq!(wrapped.result.unwrap()["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_codes() {
        let server = server();
        let unknown = server.handle("a", request("teleport", json!({}))).await;
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);

        let invalid = server.handle("a", request("send_message", json!({}))).await;
        assert_eq!(invalid.error.unwrap().code, INVALID_PARAMS);

        let missing = server
            .handle("a", request("complete_task", json!({"task_id": "nope"})))
            .await;
        assert_eq!(missing.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = server().handle("a", request("tools/list", Value::Null)).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 12);
    }

    #[tokio::test]
    async fn test_serve_json_lines() {
        let server = server();
        let input = concat!(
            r#"{"id":1,"method":"update_blackboard","params":{"key":"k","value":1}}"#,
            "\n\n",
            "not json\n",
            r#"{"id":2,"method":"claim_task"}"#,
            "\n",
        );
        let mut output = Vec::new();
        server
            .serve("agent", input.as_bytes(), &mut output)
            .await
            .unwrap();

        let responses: Vec<ToolResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].result.as_ref().unwrap()["version"], 1);
        assert_eq!(responses[1].error.as_ref().unwrap().code, PARSE_ERROR);
        assert_eq!(responses[2].result.as_ref().unwrap()["claimed"], false);
        assert!(server
            .stores
            .events
            .query(&EventQuery::default())
            .unwrap()
            .is_empty());
    }
}
