// ABOUTME: Folds content events of one stream into the in-flight assistant message
// ABOUTME: Idempotent against duplicate tool_start and trace delivery

use crate::event::StreamEvent;
use crate::models::{ContentPart, Message, ToolCall, ToolOutput, TraceStep};
use chrono::Utc;
use serde_json::Value;

/// What a fold did to the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// The message changed
    Applied,
    /// Already recorded; nothing changed
    Duplicate,
    /// The event referenced something unknown and was discarded
    Dropped,
    /// Not a content event (actions and terminals are routed elsewhere)
    Skipped,
}

/// Applies events to one message in arrival order.
///
/// No reordering happens here: the transport delivers one stream's events
/// in causal order and deltas are appended as they come.
pub struct MessageAccumulator<'a> {
    message: &'a mut Message,
}

impl<'a> MessageAccumulator<'a> {
    pub fn new(message: &'a mut Message) -> Self {
        Self { message }
    }

    pub fn fold(&mut self, event: &StreamEvent) -> Fold {
        let fold = match event {
            StreamEvent::TextDelta { text } => self.text_delta(text),
            StreamEvent::ThinkingDelta { text } => self.thinking_delta(text),
            StreamEvent::ToolStart {
                tool_id,
                tool_name,
                arguments,
            } => self.tool_start(tool_id, tool_name, arguments),
            StreamEvent::ToolEnd { tool_id, result } => self.tool_end(tool_id, result),
            StreamEvent::ContextTrace { steps } => self.context_trace(steps),
            _ => Fold::Skipped,
        };
        if fold == Fold::Applied {
            self.message.is_thinking = false;
        }
        fold
    }

    pub fn text_delta(&mut self, text: &str) -> Fold {
        if text.is_empty() {
            return Fold::Duplicate;
        }
        self.message.append_text(text);
        Fold::Applied
    }

    pub fn thinking_delta(&mut self, text: &str) -> Fold {
        if text.is_empty() {
            return Fold::Duplicate;
        }
        self.message.append_thinking(text);
        Fold::Applied
    }

    pub fn tool_start(&mut self, tool_id: &str, tool_name: &str, arguments: &Value) -> Fold {
        if self.message.tool_call(tool_id).is_some() {
            tracing::debug!(tool_id, "duplicate tool_start ignored");
            return Fold::Duplicate;
        }
        self.message.tool_calls.push(ToolCall::running(
            tool_id.to_string(),
            tool_name.to_string(),
            arguments.clone(),
            Utc::now(),
        ));
        self.message.content_parts.push(ContentPart::ToolUse {
            tool_id: tool_id.to_string(),
        });
        Fold::Applied
    }

    pub fn tool_end(&mut self, tool_id: &str, result: &ToolOutput) -> Fold {
        match self.message.tool_call_mut(tool_id) {
            Some(call) => {
                call.finish(result.clone(), Utc::now());
                Fold::Applied
            }
            None => {
                tracing::warn!(tool_id, "tool_end for unknown tool dropped");
                Fold::Dropped
            }
        }
    }

    pub fn context_trace(&mut self, steps: &[TraceStep]) -> Fold {
        if self.message.push_trace_steps(steps) == 0 {
            Fold::Duplicate
        } else {
            Fold::Applied
        }
    }
}
