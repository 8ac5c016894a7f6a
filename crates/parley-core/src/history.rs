// ABOUTME: Stored transcript records and their conversion into canonical messages
// ABOUTME: Rehydrated history has the same shape a live-streamed exchange would have had

use crate::actions::submission_text;
use crate::models::{
    ActionRequired, ActionStatus, ActionType, ContentPart, ImageAttachment, Message,
    MessageStatus, Question, Role, ToolCall, ToolOutput, ToolStatus, TraceStep,
    PARAGRAPH_SEPARATOR,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a stored record. `Tool` records carry tool-protocol traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawRole {
    User,
    Assistant,
    Tool,
}

/// One typed part of a stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawPart {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolRequest {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResponse {
        id: String,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageAttachment>,
    },
    ElicitationResponse {
        request_id: String,
        #[serde(default)]
        action_type: ActionType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        questions: Option<Vec<Question>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_schema: Option<Value>,
        #[serde(default)]
        user_data: Value,
    },
}

fn default_success() -> bool {
    true
}

/// One stored transcript record as returned by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: RawRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parts: Vec<RawPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_trace: Vec<TraceStep>,
}

impl RawMessage {
    fn has_text(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, RawPart::Text { text } if !text.trim().is_empty()))
    }

    /// Tool records with text are shown as user turns, the rest fold into
    /// the surrounding assistant turn.
    fn effective_role(&self) -> Role {
        match self.role {
            RawRole::User => Role::User,
            RawRole::Assistant => Role::Assistant,
            RawRole::Tool if self.has_text() => Role::User,
            RawRole::Tool => Role::Assistant,
        }
    }
}

/// Convert a stored transcript into canonical messages.
///
/// Adjacent assistant records are merged into one message, protocol-only
/// user records are dropped, and elicitation answers are attached to the
/// assistant message that asked.
pub fn normalize(raw: &[RawMessage]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::new();
    let mut last_seen: Option<DateTime<Utc>> = None;

    for (index, record) in raw.iter().enumerate() {
        let timestamp = record
            .created_at
            .or(last_seen)
            .unwrap_or_else(Utc::now);
        last_seen = Some(timestamp);

        let id = record
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("history-{index}"));
        let mut message = Message::new(id, record.effective_role(), timestamp);
        message.status = MessageStatus::Completed;
        let mut answers = Vec::new();

        for part in &record.parts {
            match part {
                RawPart::Text { text } => message.append_text(text),
                RawPart::Thinking { text } => message.append_thinking(text),
                RawPart::Image { media_type, data } => message.images.push(ImageAttachment {
                    media_type: media_type.clone(),
                    data: data.clone(),
                }),
                RawPart::ToolRequest {
                    id,
                    name,
                    arguments,
                } => {
                    if message.tool_call(id).is_none() {
                        message.tool_calls.push(ToolCall::running(
                            id.clone(),
                            name.clone(),
                            arguments.clone(),
                            timestamp,
                        ));
                        message
                            .content_parts
                            .push(ContentPart::ToolUse { tool_id: id.clone() });
                    }
                }
                RawPart::ToolResponse {
                    id,
                    success,
                    output,
                    error,
                    images,
                } => {
                    let result = ToolOutput {
                        success: *success,
                        output: output.clone(),
                        error: error.clone(),
                        images: images.clone(),
                    };
                    finish_tool(&mut message, &mut out, id, result, timestamp);
                }
                RawPart::ElicitationResponse { .. } => {
                    if let Some(action) = answered_action(part) {
                        answers.push(action);
                    }
                }
            }
        }
        message.push_trace_steps(&record.context_trace);

        for action in answers {
            attach_answer(&mut message, &mut out, action);
        }

        match message.role {
            Role::User => {
                if message.content.trim().is_empty()
                    && message.images.is_empty()
                    && message.tool_calls.is_empty()
                {
                    tracing::debug!(id = %message.id, "dropping protocol-only user record");
                    continue;
                }
                out.push(message);
            }
            Role::Assistant => match out.last_mut() {
                Some(previous) if previous.role == Role::Assistant => merge_into(previous, message),
                _ => out.push(message),
            },
        }
    }

    out.retain(|m| m.role == Role::User || has_substance(m));
    out
}

fn has_substance(message: &Message) -> bool {
    let visible_part = message
        .content_parts
        .iter()
        .any(|p| !matches!(p, ContentPart::Text { text } if text.trim().is_empty()));
    visible_part
        || !message.tool_calls.is_empty()
        || !message.action_requests.is_empty()
        || !message.context_trace.is_empty()
}

fn finish_tool(
    current: &mut Message,
    earlier: &mut [Message],
    tool_id: &str,
    result: ToolOutput,
    at: DateTime<Utc>,
) {
    let call = match current.tool_call_mut(tool_id) {
        Some(call) => Some(call),
        None => earlier
            .iter_mut()
            .rev()
            .find_map(|m| m.tool_call_mut(tool_id)),
    };
    match call {
        Some(call) => call.finish(result, at),
        None => tracing::debug!(tool_id, "tool_response without request dropped"),
    }
}

fn answered_action(part: &RawPart) -> Option<ActionRequired> {
    let RawPart::ElicitationResponse {
        request_id,
        action_type,
        tool_name,
        arguments,
        prompt,
        questions,
        requested_schema,
        user_data,
    } = part
    else {
        return None;
    };
    let mut action = ActionRequired {
        request_id: request_id.clone(),
        action_type: *action_type,
        tool_name: tool_name.clone(),
        arguments: arguments.clone(),
        prompt: prompt.clone(),
        questions: questions.clone(),
        requested_schema: requested_schema.clone(),
        is_fallback: false,
        status: Some(ActionStatus::Submitted),
        submitted_response: None,
        submitted_user_data: Some(user_data.clone()),
    };
    action.submitted_response = Some(submission_text(&action, user_data));
    Some(action)
}

fn attach_answer(current: &mut Message, earlier: &mut [Message], action: ActionRequired) {
    let target = if current.role == Role::Assistant {
        Some(current)
    } else {
        earlier.iter_mut().rev().find(|m| m.role == Role::Assistant)
    };
    let Some(target) = target else {
        tracing::debug!(request_id = %action.request_id, "answer without assistant message dropped");
        return;
    };
    match target.action_mut(&action.request_id) {
        Some(existing) => *existing = action,
        None => target.push_action(action),
    }
}

fn merge_into(target: &mut Message, next: Message) {
    if !next.content.is_empty() {
        if !target.content.is_empty() {
            target.content.push_str(PARAGRAPH_SEPARATOR);
        }
        target.content.push_str(&next.content);
    }

    for part in next.content_parts {
        let referenced = matches!(
            part,
            ContentPart::ToolUse { .. } | ContentPart::ActionRequired { .. }
        );
        if referenced && target.content_parts.contains(&part) {
            continue;
        }
        target.content_parts.push(part);
    }

    for call in next.tool_calls {
        match target.tool_call_mut(&call.id) {
            // A repeated request must not reopen a finished call
            Some(existing) if call.status == ToolStatus::Running => {
                if existing.status == ToolStatus::Running {
                    *existing = call;
                }
            }
            Some(existing) => *existing = call,
            None => target.tool_calls.push(call),
        }
    }

    for action in next.action_requests {
        match target.action_mut(&action.request_id) {
            Some(existing) => *existing = action,
            None => target.action_requests.push(action),
        }
    }

    target.images.extend(next.images);
    target.push_trace_steps(&next.context_trace);
}
