// ABOUTME: Error types for parley-core
// ABOUTME: Rejections produced by the inbound event parser

use thiserror::Error;

/// Why an inbound event payload was rejected
#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid {event} event: {reason}")]
    Invalid {
        event: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parse_error_display_invalid() {
        let err = EventParseError::Invalid {
            event: "tool_start",
            reason: "empty tool_id",
        };
        let display = format!("{}", err);
        assert!(display.contains("Invalid tool_start event"));
        assert!(display.contains("empty tool_id"));
    }

    #[test]
    fn test_event_parse_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EventParseError = serde_err.into();
        assert!(matches!(err, EventParseError::Malformed(_)));
        assert!(format!("{}", err).contains("Malformed event"));
    }
}
