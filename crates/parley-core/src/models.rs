// ABOUTME: Data model shared by the stream folder, the action registry and the normalizer
// ABOUTME: Message, ContentPart, ToolCall, ActionRequired, Topic and ExecutionStrategy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Separator inserted into the flattened text view between text segments
/// that are split by tool activity or by stored transcript entries.
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle of a message. Assistant messages walk
/// `Pending -> Streaming -> {Completed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    #[default]
    Completed,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One typed fragment of a message body, in display order.
///
/// Tool and action fragments reference entries of [`Message::tool_calls`] and
/// [`Message::action_requests`] by id, so status updates happen in one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Thinking { text: String },
    ToolUse { tool_id: String },
    ActionRequired { request_id: String },
}

/// Base64 image attached to a user message or returned by a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

/// Tool execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

/// Result payload reported when a tool finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

impl ToolOutput {
    /// Output rendered as display text (strings are shown verbatim)
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A tool invocation issued by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    pub status: ToolStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutput>,
}

impl ToolCall {
    pub fn running(id: String, name: String, arguments: Value, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            arguments,
            status: ToolStatus::Running,
            start_time,
            end_time: None,
            result: None,
        }
    }

    /// Move to `completed` or `failed` depending on the reported outcome
    pub fn finish(&mut self, result: ToolOutput, at: DateTime<Utc>) {
        self.status = if result.success {
            ToolStatus::Completed
        } else {
            ToolStatus::Failed
        };
        self.end_time = Some(at);
        self.result = Some(result);
    }
}

/// Kind of decision the runtime is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ToolConfirmation,
    #[default]
    AskUser,
    Elicitation,
}

impl ActionType {
    /// Actions that need information only the user can supply
    pub fn needs_user_input(self) -> bool {
        matches!(self, Self::AskUser | Self::Elicitation)
    }
}

/// Submission state of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Submitted,
}

/// Option offered with an ask_user question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A structured question carried by an ask_user action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// A request that execution cannot continue without a human (or auto-policy) decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequired {
    pub request_id: String,
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions: Option<Vec<Question>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_schema: Option<Value>,
    /// Synthesized client-side before the runtime issued a real request id
    #[serde(default)]
    pub is_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_user_data: Option<Value>,
}

impl ActionRequired {
    pub fn is_submitted(&self) -> bool {
        self.status == Some(ActionStatus::Submitted)
    }

    /// Key used to recognise two actions as the same logical prompt:
    /// trimmed prompt, else first question, else schema description.
    pub fn prompt_key(&self) -> Option<String> {
        let non_empty = |s: &str| {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };

        if let Some(key) = self.prompt.as_deref().and_then(non_empty) {
            return Some(key);
        }
        if let Some(key) = self
            .questions
            .as_ref()
            .and_then(|qs| qs.first())
            .and_then(|q| non_empty(&q.question))
        {
            return Some(key);
        }
        self.requested_schema
            .as_ref()
            .and_then(|schema| schema.get("description"))
            .and_then(Value::as_str)
            .and_then(non_empty)
    }

    /// Copy the request fields of `other`, keeping submission state
    pub fn refresh_from(&mut self, other: &ActionRequired) {
        self.action_type = other.action_type;
        self.tool_name = other.tool_name.clone();
        self.arguments = other.arguments.clone();
        self.prompt = other.prompt.clone();
        self.questions = other.questions.clone();
        self.requested_schema = other.requested_schema.clone();
        self.is_fallback = other.is_fallback;
    }
}

/// A step reported by the runtime's context pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceStep {
    pub stage: String,
    pub detail: String,
}

/// A chat message (user or assistant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Flattened text view of every text part
    pub content: String,
    #[serde(default)]
    pub content_parts: Vec<ContentPart>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub action_requests: Vec<ActionRequired>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_trace: Vec<TraceStep>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_thinking: bool,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Empty message with the given identity
    pub fn new(id: String, role: Role, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            content: String::new(),
            content_parts: Vec::new(),
            tool_calls: Vec::new(),
            action_requests: Vec::new(),
            images: Vec::new(),
            context_trace: Vec::new(),
            timestamp,
            is_thinking: false,
            status: MessageStatus::Completed,
            error: None,
        }
    }

    pub fn user(text: String, images: Vec<ImageAttachment>) -> Self {
        let mut msg = Self::new(
            format!("user-{}", uuid::Uuid::new_v4()),
            Role::User,
            Utc::now(),
        );
        msg.append_text(&text);
        msg.images = images;
        msg
    }

    /// Placeholder inserted at send time so the UI has something to show
    pub fn assistant_placeholder() -> Self {
        let mut msg = Self::new(
            format!("assistant-{}", uuid::Uuid::new_v4()),
            Role::Assistant,
            Utc::now(),
        );
        msg.is_thinking = true;
        msg.status = MessageStatus::Pending;
        msg
    }

    /// Append text to the trailing text part, or open a new one.
    ///
    /// A new part opened after earlier content is separated from it by a
    /// blank line in the flattened view.
    pub fn append_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(ContentPart::Text { text: tail }) = self.content_parts.last_mut() {
            tail.push_str(text);
            self.content.push_str(text);
            return;
        }
        if !self.content.is_empty() {
            self.content.push_str(PARAGRAPH_SEPARATOR);
        }
        self.content.push_str(text);
        self.content_parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }

    /// Append reasoning text to the trailing thinking part, or open a new one
    pub fn append_thinking(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(ContentPart::Thinking { text: tail }) = self.content_parts.last_mut() {
            tail.push_str(text);
        } else {
            self.content_parts.push(ContentPart::Thinking {
                text: text.to_string(),
            });
        }
    }

    /// Add trace steps not already recorded; returns how many were added
    pub fn push_trace_steps<'a>(&mut self, steps: impl IntoIterator<Item = &'a TraceStep>) -> usize {
        let mut added = 0;
        for step in steps {
            if !self.context_trace.contains(step) {
                self.context_trace.push(step.clone());
                added += 1;
            }
        }
        added
    }

    pub fn tool_call(&self, tool_id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.id == tool_id)
    }

    pub fn tool_call_mut(&mut self, tool_id: &str) -> Option<&mut ToolCall> {
        self.tool_calls.iter_mut().find(|c| c.id == tool_id)
    }

    pub fn action(&self, request_id: &str) -> Option<&ActionRequired> {
        self.action_requests
            .iter()
            .find(|a| a.request_id == request_id)
    }

    pub fn action_mut(&mut self, request_id: &str) -> Option<&mut ActionRequired> {
        self.action_requests
            .iter_mut()
            .find(|a| a.request_id == request_id)
    }

    /// Append an action entry and its content part
    pub fn push_action(&mut self, action: ActionRequired) {
        self.content_parts.push(ContentPart::ActionRequired {
            request_id: action.request_id.clone(),
        });
        self.action_requests.push(action);
    }

    /// Remove an action entry and its content part, returning the
    /// positions it occupied (entry index, part index)
    pub fn remove_action(&mut self, request_id: &str) -> Option<(usize, Option<usize>)> {
        let entry = self
            .action_requests
            .iter()
            .position(|a| a.request_id == request_id)?;
        self.action_requests.remove(entry);
        let part = self.content_parts.iter().position(
            |p| matches!(p, ContentPart::ActionRequired { request_id: id } if id == request_id),
        );
        if let Some(index) = part {
            self.content_parts.remove(index);
        }
        Some((entry, part))
    }

    /// Whether nothing at all has been recorded in this message
    pub fn is_blank(&self) -> bool {
        self.content.is_empty()
            && self.content_parts.is_empty()
            && self.tool_calls.is_empty()
            && self.action_requests.is_empty()
            && self.images.is_empty()
            && self.context_trace.is_empty()
    }
}

/// Policy controlling whether tool confirmations are auto-approved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    React,
    CodeOrchestrated,
    Auto,
}

impl ExecutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::React => "react",
            Self::CodeOrchestrated => "code_orchestrated",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "react" => Ok(Self::React),
            "code_orchestrated" | "code-orchestrated" => Ok(Self::CodeOrchestrated),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown execution strategy: {other}")),
        }
    }
}

/// One continuous multi-turn exchange with the agent runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages_count: u32,
    #[serde(default)]
    pub execution_strategy: ExecutionStrategy,
}
