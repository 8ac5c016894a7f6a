// ABOUTME: Tracks confirmable actions requested mid-stream (tool permission, questions, elicitation)
// ABOUTME: Reconciles client-side fallback prompts with the runtime's authoritative requests

use crate::models::{
    ActionRequired, ActionStatus, ActionType, ContentPart, ExecutionStrategy, Message, Question,
};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

/// Tool names that ask the user something: `ask_user`, `askUser`,
/// `ask_question`, `ask_followup_question`, `mcp__ask_human`, ...
pub const DEFAULT_ASK_TOOL_PATTERN: &str =
    r"(?i)(?:^|[_.:/-])ask(?:$|[_-]?(?:user|human|question|followup))";

/// Argument fields searched, in order, for a fallback prompt
const PROMPT_FIELDS: [&str; 4] = ["question", "prompt", "message", "text"];

/// An unsubmitted action together with the message that displays it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingAction {
    pub message_id: String,
    pub action: ActionRequired,
}

/// Outcome of registering an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// New pending entry
    Added,
    /// New pending entry that took the place of entries for the same prompt
    Replaced { replaced: Vec<String> },
    /// Same request id was already known; its fields were refreshed
    Updated,
    /// Nothing changed (already answered, or an equivalent prompt is pending)
    Skipped,
}

/// Pending set of confirmable actions for one session
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    pending: Vec<PendingAction>,
    ask_pattern: Regex,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new(default_ask_pattern())
    }
}

/// Compiled [`DEFAULT_ASK_TOOL_PATTERN`]
pub fn default_ask_pattern() -> Regex {
    Regex::new(DEFAULT_ASK_TOOL_PATTERN).expect("default ask pattern is a valid regex")
}

impl ActionRegistry {
    pub fn new(ask_pattern: Regex) -> Self {
        Self {
            pending: Vec::new(),
            ask_pattern,
        }
    }

    pub fn with_pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(Regex::new(pattern)?))
    }

    pub fn pending(&self) -> &[PendingAction] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, request_id: &str) -> Option<&PendingAction> {
        self.pending
            .iter()
            .find(|p| p.action.request_id == request_id)
    }

    pub fn is_ask_tool(&self, tool_name: &str) -> bool {
        self.ask_pattern.is_match(tool_name)
    }

    /// Synthesize a fallback ask_user action for a tool that asks the user
    /// something, before the runtime has issued the real request.
    pub fn fallback_for_tool(
        &self,
        tool_id: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Option<ActionRequired> {
        if !self.is_ask_tool(tool_name) {
            return None;
        }
        let questions = parse_questions(arguments.get("questions"));
        let prompt = prompt_from_arguments(arguments);
        if prompt.is_none() && questions.is_none() {
            tracing::debug!(tool_id, tool_name, "ask tool without a prompt; no fallback");
            return None;
        }
        Some(ActionRequired {
            request_id: format!("fallback-{tool_id}"),
            action_type: ActionType::AskUser,
            tool_name: Some(tool_name.to_string()),
            arguments: Some(arguments.clone()),
            prompt,
            questions,
            requested_schema: None,
            is_fallback: true,
            status: None,
            submitted_response: None,
            submitted_user_data: None,
        })
    }

    /// Record an action on `message_id` and in the pending set.
    ///
    /// Authoritative ask_user/elicitation actions replace every pending action
    /// of the same type with the same prompt key, taking the first one's place
    /// in the message. Fallbacks never displace anything.
    pub fn register(
        &mut self,
        messages: &mut [Message],
        message_id: &str,
        action: ActionRequired,
    ) -> Registration {
        if let Some(entry) = self
            .pending
            .iter_mut()
            .find(|p| p.action.request_id == action.request_id)
        {
            entry.action.refresh_from(&action);
            if let Some(existing) = find_message_mut(messages, &entry.message_id)
                .and_then(|m| m.action_mut(&action.request_id))
            {
                existing.refresh_from(&action);
            }
            return Registration::Updated;
        }

        if messages
            .iter()
            .filter_map(|m| m.action(&action.request_id))
            .any(|a| a.is_submitted())
        {
            tracing::debug!(request_id = %action.request_id, "action already answered");
            return Registration::Skipped;
        }

        let key = action.prompt_key();
        let same_prompt = |p: &PendingAction| {
            p.action.action_type == action.action_type
                && key.is_some()
                && p.action.prompt_key() == key
        };

        if action.is_fallback {
            if self.pending.iter().any(same_prompt) {
                return Registration::Skipped;
            }
            self.insert(messages, message_id, action, None);
            return Registration::Added;
        }

        let mut replaced = Vec::new();
        let mut slot = None;
        if action.action_type.needs_user_input() && key.is_some() {
            let (matched, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.pending).into_iter().partition(same_prompt);
            self.pending = kept;
            for old in matched {
                let removed = find_message_mut(messages, &old.message_id)
                    .and_then(|m| m.remove_action(&old.action.request_id));
                if slot.is_none() && old.message_id == message_id {
                    slot = removed;
                }
                tracing::debug!(
                    replaced = %old.action.request_id,
                    by = %action.request_id,
                    "pending action replaced by prompt"
                );
                replaced.push(old.action.request_id);
            }
        }

        self.insert(messages, message_id, action, slot);
        if replaced.is_empty() {
            Registration::Added
        } else {
            Registration::Replaced { replaced }
        }
    }

    fn insert(
        &mut self,
        messages: &mut [Message],
        message_id: &str,
        action: ActionRequired,
        slot: Option<(usize, Option<usize>)>,
    ) {
        match find_message_mut(messages, message_id) {
            Some(message) => {
                if let Some(existing) = message.action_mut(&action.request_id) {
                    existing.refresh_from(&action);
                } else if let Some((entry, part)) = slot {
                    let part_ref = ContentPart::ActionRequired {
                        request_id: action.request_id.clone(),
                    };
                    match part {
                        Some(index) => message.content_parts.insert(index, part_ref),
                        None => message.content_parts.push(part_ref),
                    }
                    message.action_requests.insert(entry, action.clone());
                } else {
                    message.push_action(action.clone());
                }
            }
            None => {
                tracing::warn!(message_id, request_id = %action.request_id, "action for unknown message");
            }
        }
        self.pending.push(PendingAction {
            message_id: message_id.to_string(),
            action,
        });
    }

    /// Mark an action submitted: it leaves the pending set and stays on its
    /// message as a read-only echo of the answer.
    pub fn submit(
        &mut self,
        messages: &mut [Message],
        request_id: &str,
        response: String,
        user_data: Value,
    ) -> Option<ActionRequired> {
        let index = self
            .pending
            .iter()
            .position(|p| p.action.request_id == request_id)?;
        let mut entry = self.pending.remove(index);
        apply_submission(&mut entry.action, &response, &user_data);

        if let Some(action) =
            find_message_mut(messages, &entry.message_id).and_then(|m| m.action_mut(request_id))
        {
            apply_submission(action, &response, &user_data);
        }
        Some(entry.action)
    }

    /// Drop every pending action shown on `message_id`
    pub fn discard_for_message(&mut self, message_id: &str) -> Vec<ActionRequired> {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.message_id == message_id);
        self.pending = kept;
        dropped.into_iter().map(|p| p.action).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn apply_submission(action: &mut ActionRequired, response: &str, user_data: &Value) {
    action.status = Some(ActionStatus::Submitted);
    action.submitted_response = Some(response.to_string());
    action.submitted_user_data = Some(user_data.clone());
}

fn find_message_mut<'m>(messages: &'m mut [Message], message_id: &str) -> Option<&'m mut Message> {
    messages.iter_mut().find(|m| m.id == message_id)
}

/// Whether the policy confirms this action without asking anyone.
/// Questions for the user are never auto-confirmed.
pub fn should_auto_confirm(strategy: ExecutionStrategy, action: &ActionRequired) -> bool {
    strategy == ExecutionStrategy::Auto
        && action.action_type == ActionType::ToolConfirmation
        && !action.is_fallback
}

/// Structured payload recorded for a tool confirmation decision
pub fn confirmation_payload(approved: bool, reason: &str) -> Value {
    json!({ "approved": approved, "reason": reason })
}

/// Display text for a submitted action's answer
pub fn submission_text(action: &ActionRequired, user_data: &Value) -> String {
    if action.action_type == ActionType::ToolConfirmation {
        let approved = user_data
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        return if approved { "approved" } else { "denied" }.to_string();
    }
    flatten_answer(user_data, action)
}

/// Flatten a structured answer: explicit `answer` field, else the field keyed
/// by the question text, else the whole payload as JSON.
pub fn flatten_answer(user_data: &Value, action: &ActionRequired) -> String {
    let text = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let Value::Object(fields) = user_data else {
        return text(user_data);
    };
    if let Some(answer) = fields.get("answer") {
        return text(answer);
    }
    let question_texts = action
        .questions
        .iter()
        .flatten()
        .map(|q| q.question.as_str())
        .chain(action.prompt.as_deref());
    for question in question_texts {
        if let Some(value) = fields.get(question).or_else(|| fields.get(question.trim())) {
            return text(value);
        }
    }
    user_data.to_string()
}

fn prompt_from_arguments(arguments: &Value) -> Option<String> {
    PROMPT_FIELDS
        .iter()
        .filter_map(|field| arguments.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

/// Questions given either as objects or as plain strings
fn parse_questions(value: Option<&Value>) -> Option<Vec<Question>> {
    let items = value?.as_array()?;
    let questions: Vec<Question> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(Question {
                question: s.clone(),
                header: None,
                options: Vec::new(),
                multi_select: false,
            }),
            other => serde_json::from_value(other.clone()).ok(),
        })
        .collect();
    (!questions.is_empty()).then_some(questions)
}
