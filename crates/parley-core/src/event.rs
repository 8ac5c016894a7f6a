// ABOUTME: Inbound streaming events from the agent runtime
// ABOUTME: Tagged-variant parser that validates required fields before folding

use crate::error::EventParseError;
use crate::models::{ActionRequired, ActionType, Question, ToolOutput, TraceStep};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of an `action_required` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
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
}

impl ActionRequest {
    /// The authoritative (non-fallback, unsubmitted) action for this request
    pub fn into_action(self) -> ActionRequired {
        ActionRequired {
            request_id: self.request_id,
            action_type: self.action_type,
            tool_name: self.tool_name,
            arguments: self.arguments,
            prompt: self.prompt,
            questions: self.questions,
            requested_schema: self.requested_schema,
            is_fallback: false,
            status: None,
            submitted_response: None,
            submitted_user_data: None,
        }
    }
}

/// Events delivered on one in-flight message's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolStart {
        tool_id: String,
        tool_name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolEnd {
        tool_id: String,
        result: ToolOutput,
    },
    ActionRequired(ActionRequest),
    ContextTrace {
        steps: Vec<TraceStep>,
    },
    FinalDone,
    Error {
        message: String,
    },
    Warning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

impl StreamEvent {
    /// Parse and validate a raw JSON payload
    pub fn parse(value: Value) -> Result<Self, EventParseError> {
        let event: StreamEvent = serde_json::from_value(value)?;
        event.validate()?;
        Ok(event)
    }

    /// Parse and validate one line of JSON text
    pub fn parse_str(text: &str) -> Result<Self, EventParseError> {
        let event: StreamEvent = serde_json::from_str(text)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), EventParseError> {
        let invalid = |reason: &'static str| -> Result<(), EventParseError> {
            Err(EventParseError::Invalid {
                event: self.kind(),
                reason,
            })
        };
        match self {
            Self::ToolStart {
                tool_id, tool_name, ..
            } => {
                if tool_id.trim().is_empty() {
                    return invalid("empty tool_id");
                }
                if tool_name.trim().is_empty() {
                    return invalid("empty tool_name");
                }
            }
            Self::ToolEnd { tool_id, .. } if tool_id.trim().is_empty() => {
                return invalid("empty tool_id");
            }
            Self::ActionRequired(request) if request.request_id.trim().is_empty() => {
                return invalid("empty request_id");
            }
            _ => {}
        }
        Ok(())
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::ActionRequired(_) => "action_required",
            Self::ContextTrace { .. } => "context_trace",
            Self::FinalDone => "final_done",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
        }
    }

    /// Whether this event closes the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalDone | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_text_delta() {
        let event = StreamEvent::parse(json!({"type": "text_delta", "text": "Hi"})).unwrap();
        assert_eq!(event, StreamEvent::TextDelta { text: "Hi".into() });
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_parse_final_done_ignores_extra_fields() {
        let event = StreamEvent::parse(json!({"type": "final_done", "usage": {}})).unwrap();
        assert_eq!(event, StreamEvent::FinalDone);
        assert!(event.is_terminal());
    }

    #[test]
    fn test_parse_tool_end_with_result() {
        let event = StreamEvent::parse(json!({
            "type": "tool_end",
            "tool_id": "t1",
            "result": {"success": true, "output": "ok"}
        }))
        .unwrap();
        match event {
            StreamEvent::ToolEnd { tool_id, result } => {
                assert_eq!(tool_id, "t1");
                assert!(result.success);
                assert_eq!(result.output_text(), "ok");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_action_required() {
        let event = StreamEvent::parse(json!({
            "type": "action_required",
            "request_id": "r1",
            "action_type": "ask_user",
            "prompt": "Pick a color"
        }))
        .unwrap();
        let StreamEvent::ActionRequired(request) = event else {
            panic!("expected action_required");
        };
        let action = request.into_action();
        assert_eq!(action.request_id, "r1");
        assert_eq!(action.action_type, ActionType::AskUser);
        assert!(!action.is_fallback);
        assert!(!action.is_submitted());
    }

    #[test]
    fn test_parse_warning_without_code() {
        let event =
            StreamEvent::parse(json!({"type": "warning", "message": "slow down"})).unwrap();
        assert_eq!(
            event,
            StreamEvent::Warning {
                code: None,
                message: "slow down".into()
            }
        );
    }

    #[test]
    fn test_rejects_missing_required_field() {
        let err = StreamEvent::parse(json!({"type": "tool_start", "tool_name": "bash"}))
            .unwrap_err();
        assert!(matches!(err, EventParseError::Malformed(_)));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = StreamEvent::parse(json!({"type": "confetti"})).unwrap_err();
        assert!(matches!(err, EventParseError::Malformed(_)));
    }

    #[test]
    fn test_rejects_empty_ids() {
        let err = StreamEvent::parse(json!({
            "type": "tool_start",
            "tool_id": " ",
            "tool_name": "bash",
            "arguments": {}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            EventParseError::Invalid {
                event: "tool_start",
                ..
            }
        ));

        let err = StreamEvent::parse_str(
            r#"{"type":"action_required","request_id":"","action_type":"elicitation"}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EventParseError::Invalid {
                event: "action_required",
                ..
            }
        ));
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let json = serde_json::to_value(StreamEvent::ContextTrace {
            steps: vec![TraceStep {
                stage: "retrieve".into(),
                detail: "2 docs".into(),
            }],
        })
        .unwrap();
        assert_eq!(json["type"], "context_trace");
        assert_eq!(json["steps"][0]["stage"], "retrieve");
    }
}
