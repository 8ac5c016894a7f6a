// ABOUTME: CLI library components for the parley command-line tool.
// ABOUTME: Transcript normalization and event-log replay shared by the subcommands.

//! # parley-cli
//!
//! Offline tooling around the parley session engine.
//!
//! ```text
//! parley
//! ├── normalize <transcript.json>   # Stored transcript -> display messages
//! ├── replay <events.jsonl>         # Fold an event log into one reply
//! ├── store
//! │   ├── show --workspace <id>     # Current session, cache and preferences
//! │   ├── migrate --workspace <id>  # Move legacy unscoped keys
//! │   └── claim <session> --workspace <id>
//! └── version                       # Show version info
//! ```

use anyhow::{Context, Result};
use parley_core::{
    normalize, ActionRegistry, Fold, Message, MessageAccumulator, MessageStatus, PendingAction,
    RawMessage, StreamEvent,
};
use serde::Serialize;

/// Version of the parley CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse a JSON array of stored records and normalize it
pub fn normalize_transcript(json: &str) -> Result<Vec<Message>> {
    let raw: Vec<RawMessage> =
        serde_json::from_str(json).context("Transcript is not a JSON array of records")?;
    Ok(normalize(&raw))
}

/// Outcome of replaying an event log
#[derive(Debug, Serialize)]
pub struct Replay {
    pub message: Message,
    pub pending_actions: Vec<PendingAction>,
    /// Lines that did not parse as events
    pub skipped: Vec<usize>,
}

/// Fold newline-delimited events into a single assistant message.
///
/// Blank lines are ignored. Events after a terminal event are ignored.
pub fn replay_events(jsonl: &str, ask_pattern: &str) -> Result<Replay> {
    let mut registry =
        ActionRegistry::with_pattern(ask_pattern).context("Invalid ask tool pattern")?;
    let mut messages = vec![Message::assistant_placeholder()];
    let message_id = messages[0].id.clone();
    let mut skipped = Vec::new();

    for (index, line) in jsonl.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let event = match StreamEvent::parse_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping event");
                skipped.push(line_no);
                continue;
            }
        };
        if messages[0].status == MessageStatus::Pending {
            messages[0].status = MessageStatus::Streaming;
        }

        match &event {
            StreamEvent::FinalDone => {
                messages[0].status = MessageStatus::Completed;
                break;
            }
            StreamEvent::Error { message } => {
                messages[0].status = MessageStatus::Failed;
                messages[0].error = Some(message.clone());
                break;
            }
            StreamEvent::ActionRequired(request) => {
                messages[0].is_thinking = false;
                registry.register(&mut messages, &message_id, request.clone().into_action());
            }
            StreamEvent::ToolStart {
                tool_id,
                tool_name,
                arguments,
            } => {
                let fold = MessageAccumulator::new(&mut messages[0]).fold(&event);
                if fold != Fold::Applied {
                    continue;
                }
                if let Some(fallback) = registry.fallback_for_tool(tool_id, tool_name, arguments) {
                    registry.register(&mut messages, &message_id, fallback);
                }
            }
            event => {
                MessageAccumulator::new(&mut messages[0]).fold(event);
            }
        }
    }

    let mut message = messages.remove(0);
    if !message.status.is_terminal() {
        // Log ended without a terminal event
        message.status = MessageStatus::Completed;
    }
    message.is_thinking = false;

    Ok(Replay {
        message,
        pending_actions: registry.pending().to_vec(),
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::actions::DEFAULT_ASK_TOOL_PATTERN;

    #[test]
    fn test_replay_folds_text_and_tools() {
        let log = r#"{"type":"text_delta","text":"Let me check"}
{"type":"tool_start","tool_id":"t1","tool_name":"search","arguments":{"q":"x"}}
{"type":"tool_end","tool_id":"t1","result":{"success":true,"output":"found"}}

{"type":"text_delta","text":"Done."}
{"type":"final_done"}
{"type":"text_delta","text":"ignored"}
"#;
        let replay = replay_events(log, DEFAULT_ASK_TOOL_PATTERN).unwrap();
        assert_eq!(replay.message.content, "Let me check\n\nDone.");
        assert_eq!(replay.message.status, MessageStatus::Completed);
        assert_eq!(replay.message.tool_calls.len(), 1);
        assert!(replay.skipped.is_empty());
    }

    #[test]
    fn test_replay_records_error_and_bad_lines() {
        let log = "{\"type\":\"text_delta\",\"text\":\"partial\"}\nnot json\n{\"type\":\"error\",\"message\":\"boom\"}\n";
        let replay = replay_events(log, DEFAULT_ASK_TOOL_PATTERN).unwrap();
        assert_eq!(replay.message.status, MessageStatus::Failed);
        assert_eq!(replay.message.error.as_deref(), Some("boom"));
        assert_eq!(replay.skipped, vec![2]);
    }

    #[test]
    fn test_replay_keeps_unanswered_actions() {
        let log = r#"{"type":"tool_start","tool_id":"t1","tool_name":"ask_user","arguments":{"question":"Which?"}}
{"type":"action_required","request_id":"r1","action_type":"ask_user","prompt":"Which?"}
"#;
        let replay = replay_events(log, DEFAULT_ASK_TOOL_PATTERN).unwrap();
        assert_eq!(replay.pending_actions.len(), 1);
        assert_eq!(replay.pending_actions[0].action.request_id, "r1");
        assert_eq!(replay.message.status, MessageStatus::Completed);
    }

    #[test]
    fn test_replay_repeated_ask_tool_does_not_reopen_question() {
        let log = r#"{"type":"tool_start","tool_id":"t1","tool_name":"ask_user","arguments":{"question":"Which?"}}
{"type":"action_required","request_id":"r1","action_type":"ask_user","prompt":"Which?"}
{"type":"tool_start","tool_id":"t1","tool_name":"ask_user","arguments":{"question":"Which?"}}
"#;
        let replay = replay_events(log, DEFAULT_ASK_TOOL_PATTERN).unwrap();
        assert_eq!(replay.pending_actions.len(), 1);
        assert_eq!(replay.pending_actions[0].action.request_id, "r1");
        assert_eq!(replay.message.action_requests.len(), 1);
    }

    #[test]
    fn test_replay_rejects_bad_pattern() {
        assert!(replay_events("", "(").is_err());
    }

    #[test]
    fn test_normalize_transcript() {
        let json = r#"[
            {"role": "user", "parts": [{"type": "text", "text": "hi"}]},
            {"role": "assistant", "parts": [{"type": "text", "text": "hello"}]}
        ]"#;
        let messages = normalize_transcript(json).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "hello");
        assert!(normalize_transcript("{}").is_err());
    }
}
