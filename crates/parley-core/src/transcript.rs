// ABOUTME: Serializes live messages into stored transcript records
// ABOUTME: Inverse of history::normalize for completed exchanges

use crate::history::{RawMessage, RawPart, RawRole};
use crate::models::{ContentPart, Message, Role};

/// Serialize messages the way the runtime stores them.
///
/// An assistant message becomes one assistant record per segment between
/// answered actions, each followed by a tool record with the results of the
/// tools it started. Answered actions become user records. Unanswered and
/// fallback actions are not stored.
pub fn to_raw(messages: &[Message]) -> Vec<RawMessage> {
    let mut out = Vec::new();
    for message in messages {
        match message.role {
            Role::User => out.push(user_record(message)),
            Role::Assistant => SegmentWriter::new(message, &mut out).write(),
        }
    }
    out
}

fn user_record(message: &Message) -> RawMessage {
    let mut parts: Vec<RawPart> = message
        .content_parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(RawPart::Text { text: text.clone() }),
            _ => None,
        })
        .collect();
    if parts.is_empty() && !message.content.is_empty() {
        parts.push(RawPart::Text {
            text: message.content.clone(),
        });
    }
    parts.extend(message.images.iter().map(|image| RawPart::Image {
        media_type: image.media_type.clone(),
        data: image.data.clone(),
    }));

    RawMessage {
        id: Some(message.id.clone()),
        role: RawRole::User,
        created_at: Some(message.timestamp),
        parts,
        context_trace: Vec::new(),
    }
}

struct SegmentWriter<'a> {
    message: &'a Message,
    out: &'a mut Vec<RawMessage>,
    parts: Vec<RawPart>,
    responses: Vec<RawPart>,
    segments: usize,
    tool_records: usize,
    answers: usize,
}

impl<'a> SegmentWriter<'a> {
    fn new(message: &'a Message, out: &'a mut Vec<RawMessage>) -> Self {
        Self {
            message,
            out,
            parts: Vec::new(),
            responses: Vec::new(),
            segments: 0,
            tool_records: 0,
            answers: 0,
        }
    }

    fn write(mut self) {
        let message = self.message;
        for part in &message.content_parts {
            match part {
                ContentPart::Text { text } => self.parts.push(RawPart::Text { text: text.clone() }),
                ContentPart::Thinking { text } => {
                    self.parts.push(RawPart::Thinking { text: text.clone() })
                }
                ContentPart::ToolUse { tool_id } => self.tool_use(tool_id),
                ContentPart::ActionRequired { request_id } => self.action(request_id),
            }
        }
        self.flush();
    }

    fn tool_use(&mut self, tool_id: &str) {
        let Some(call) = self.message.tool_call(tool_id) else {
            return;
        };
        self.parts.push(RawPart::ToolRequest {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
        if let Some(result) = &call.result {
            self.responses.push(RawPart::ToolResponse {
                id: call.id.clone(),
                success: result.success,
                output: result.output.clone(),
                error: result.error.clone(),
                images: result.images.clone(),
            });
        }
    }

    fn action(&mut self, request_id: &str) {
        let Some(action) = self.message.action(request_id) else {
            return;
        };
        if !action.is_submitted() || action.is_fallback {
            return;
        }
        self.flush();

        self.answers += 1;
        self.out.push(RawMessage {
            id: Some(format!("{}-answer-{}", self.message.id, self.answers)),
            role: RawRole::User,
            created_at: Some(self.message.timestamp),
            parts: vec![RawPart::ElicitationResponse {
                request_id: action.request_id.clone(),
                action_type: action.action_type,
                tool_name: action.tool_name.clone(),
                arguments: action.arguments.clone(),
                prompt: action.prompt.clone(),
                questions: action.questions.clone(),
                requested_schema: action.requested_schema.clone(),
                user_data: action.submitted_user_data.clone().unwrap_or_default(),
            }],
            context_trace: Vec::new(),
        });
    }

    /// Emit the pending segment. The first record is always written so the
    /// message id survives a round trip.
    fn flush(&mut self) {
        if self.segments == 0 || !self.parts.is_empty() {
            let id = if self.segments == 0 {
                self.message.id.clone()
            } else {
                format!("{}-{}", self.message.id, self.segments)
            };
            let context_trace = if self.segments == 0 {
                self.message.context_trace.clone()
            } else {
                Vec::new()
            };
            self.out.push(RawMessage {
                id: Some(id),
                role: RawRole::Assistant,
                created_at: Some(self.message.timestamp),
                parts: std::mem::take(&mut self.parts),
                context_trace,
            });
            self.segments += 1;
        }

        if !self.responses.is_empty() {
            self.tool_records += 1;
            self.out.push(RawMessage {
                id: Some(format!("{}-tool-{}", self.message.id, self.tool_records)),
                role: RawRole::Tool,
                created_at: Some(self.message.timestamp),
                parts: std::mem::take(&mut self.responses),
                context_trace: Vec::new(),
            });
        }
    }
}
