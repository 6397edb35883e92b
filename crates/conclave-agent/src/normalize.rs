use conclave_core::types::{AgentStatus, AssistantContent, BackendEvent, StreamEvent};

const LOG_PREVIEW_CHARS: usize = 200;

/// Map a backend event onto the canonical stream.
///
/// `Done` maps to nothing: the launcher emits the single terminal `Done`
/// itself once the backend stream is over, whatever the backend did.
pub fn normalize(event: &BackendEvent) -> Option<StreamEvent> {
    match event {
        BackendEvent::SessionStarted { session_id } => Some(StreamEvent::Status {
            status: AgentStatus::Running,
            session_id: Some(session_id.clone()),
        }),
        BackendEvent::Text(text) => Some(StreamEvent::assistant_text(text.clone())),
        BackendEvent::ToolCall { id, name, input } => Some(StreamEvent::Assistant {
            content: AssistantContent::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
        }),
        BackendEvent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(StreamEvent::User {
            tool_use_id: tool_use_id.clone(),
            content: content.clone(),
            is_error: *is_error,
        }),
        BackendEvent::Error(message) => Some(StreamEvent::Error {
            message: message.clone(),
        }),
        BackendEvent::Done { .. } => None,
    }
}

/// One human-readable log line for a canonical event.
pub fn render_line(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Status { status, session_id } => match session_id {
            Some(sid) => format!("[status] {} (session {})", status, sid),
            None => format!("[status] {}", status),
        },
        StreamEvent::Assistant {
            content: AssistantContent::Text { text },
        } => text.clone(),
        StreamEvent::Assistant {
            content: AssistantContent::ToolUse { name, input, .. },
        } => format!("[tool] {} {}", name, preview(&input.to_string())),
        StreamEvent::User {
            content, is_error, ..
        } => {
            let tag = if *is_error { "tool error" } else { "tool result" };
            format!("[{}] {}", tag, preview(content))
        }
        StreamEvent::Error { message } => format!("[error] {}", message),
        StreamEvent::Done => "[done]".to_string(),
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() <= LOG_PREVIEW_CHARS {
        s.to_string()
    } else {
        let cut: String = s.chars().take(LOG_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    }
}
