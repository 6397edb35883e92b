//! Line format of agent CLIs that print one JSON object per line.
//!
//! Recognized lines: `system` (session init), `assistant` and `user`
//! messages with content blocks, `result` (usage, cost, failure flag) and
//! `error`. Anything else is ignored.

use serde::Deserialize;
use tracing::debug;

use conclave_core::types::{BackendEvent, Usage};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: Message,
    },
    User {
        message: Message,
    },
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<LineUsage>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    Error {
        #[serde(default)]
        error: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: MessageContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Blocks(Vec<Block>),
    Text(String),
    #[default]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Parts(Vec<TextPart>),
    #[default]
    Empty,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct LineUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl ToolResultContent {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Parts(parts) => parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Empty => String::new(),
        }
    }
}

/// Parse one stdout line into zero or more backend events.
pub fn parse_line(line: &str) -> Vec<BackendEvent> {
    let line = line.trim();
    if line.is_empty() {
        return vec![];
    }
    let parsed: Line = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Skipping unparseable stream-json line");
            return vec![];
        }
    };

    match parsed {
        Line::System {
            subtype,
            session_id: Some(session_id),
        } if subtype.as_deref().map_or(true, |s| s == "init") => {
            vec![BackendEvent::SessionStarted { session_id }]
        }
        Line::System { .. } | Line::Other => vec![],
        Line::Assistant { message } | Line::User { message } => blocks_to_events(message.content),
        Line::Result {
            is_error,
            result,
            usage,
            total_cost_usd,
        } => {
            let mut events = Vec::new();
            if is_error {
                events.push(BackendEvent::Error(
                    result.unwrap_or_else(|| "agent run failed".to_string()),
                ));
            }
            let usage = usage.map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cost_usd: total_cost_usd,
            });
            events.push(BackendEvent::Done { usage });
            events
        }
        Line::Error { error, message } => {
            let text = message
                .or_else(|| {
                    error.map(|e| match e {
                        serde_json::Value::String(s) => s,
                        other => other
                            .get("message")
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| other.to_string()),
                    })
                })
                .unwrap_or_else(|| "unknown backend error".to_string());
            vec![BackendEvent::Error(text)]
        }
    }
}

fn blocks_to_events(content: MessageContent) -> Vec<BackendEvent> {
    let blocks = match content {
        MessageContent::Blocks(blocks) => blocks,
        // Plain string content is the echoed prompt
        MessageContent::Text(_) | MessageContent::Empty => return vec![],
    };
    blocks
        .into_iter()
        .filter_map(|block| match block {
            Block::Text { text } if !text.is_empty() => Some(BackendEvent::Text(text)),
            Block::ToolUse { id, name, input } => Some(BackendEvent::ToolCall { id, name, input }),
            Block::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Some(BackendEvent::ToolResult {
                tool_use_id,
                content: content.into_text(),
                is_error,
            }),
            _ => None,
        })
        .collect()
}
