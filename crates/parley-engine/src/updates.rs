// ABOUTME: Change notifications broadcast by the engine and the per-send stream handle
// ABOUTME: UIs subscribe instead of registering callbacks

use crate::error::EngineError;
use parley_core::MessageStatus;
use tokio::sync::watch;

/// Severity of a user-facing notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Error,
    Warning,
    /// Transient: the request was throttled, nothing is broken
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub session_id: Option<String>,
    pub message: String,
}

/// State change broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineUpdate {
    MessagesChanged {
        session_id: String,
    },
    ActionsChanged {
        session_id: String,
    },
    StreamPhaseChanged {
        session_id: String,
        message_id: String,
        phase: MessageStatus,
    },
    /// Active workspace or topic changed
    SessionChanged {
        workspace_id: String,
        session_id: Option<String>,
    },
    Notice(Notice),
}

/// Phase of one assistant message plus its error marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProgress {
    pub status: MessageStatus,
    pub error: Option<String>,
}

impl StreamProgress {
    pub(crate) fn pending() -> Self {
        Self {
            status: MessageStatus::Pending,
            error: None,
        }
    }
}

/// Returned by `send`: identifies the in-flight message and reports its phase
#[derive(Debug)]
pub struct StreamHandle {
    pub session_id: String,
    pub message_id: String,
    progress: watch::Receiver<StreamProgress>,
}

impl StreamHandle {
    pub(crate) fn new(
        session_id: String,
        message_id: String,
        progress: watch::Receiver<StreamProgress>,
    ) -> Self {
        Self {
            session_id,
            message_id,
            progress,
        }
    }

    pub fn phase(&self) -> MessageStatus {
        self.progress.borrow().status
    }

    /// Wait for the terminal phase.
    ///
    /// A mid-stream runtime error comes back as [`EngineError::Stream`];
    /// completion and cancellation are `Ok`.
    pub async fn wait(mut self) -> Result<MessageStatus, EngineError> {
        loop {
            let progress = self.progress.borrow_and_update().clone();
            if progress.status.is_terminal() {
                return match progress.status {
                    MessageStatus::Failed => Err(EngineError::Stream(
                        progress.error.unwrap_or_else(|| "stream failed".to_string()),
                    )),
                    status => Ok(status),
                };
            }
            if self.progress.changed().await.is_err() {
                // Sender gone without a terminal phase: the stream was torn down
                return Ok(self.progress.borrow().status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_terminal_phase() {
        let (tx, rx) = watch::channel(StreamProgress::pending());
        let handle = StreamHandle::new("s1".into(), "m1".into(), rx);
        assert_eq!(handle.phase(), MessageStatus::Pending);

        tokio::spawn(async move {
            tx.send_replace(StreamProgress {
                status: MessageStatus::Streaming,
                error: None,
            });
            tx.send_replace(StreamProgress {
                status: MessageStatus::Completed,
                error: None,
            });
        });
        assert_eq!(handle.wait().await.unwrap(), MessageStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_surfaces_stream_error() {
        let (tx, rx) = watch::channel(StreamProgress::pending());
        let handle = StreamHandle::new("s1".into(), "m1".into(), rx);
        tx.send_replace(StreamProgress {
            status: MessageStatus::Failed,
            error: Some("model crashed".into()),
        });
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, EngineError::Stream(ref m) if m == "model crashed"));
    }
}
