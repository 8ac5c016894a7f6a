// ABOUTME: AgentRuntime trait defining how the engine talks to the remote agent runtime
// ABOUTME: Sessions, message submission with a per-message event channel, confirmations, transcripts

use async_trait::async_trait;
use parley_core::{ExecutionStrategy, ImageAttachment, RawMessage, Topic};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure reported by the runtime collaborator
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// One user turn handed to the runtime
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub session_id: String,
    /// Key of the event channel; equal to the assistant message id
    pub channel_key: String,
    pub text: String,
    pub images: Vec<ImageAttachment>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub execution_strategy: ExecutionStrategy,
}

/// Remote agent runtime
///
/// `send_message` receives the sending half of the message's event channel.
/// Raw JSON events pushed into it are parsed and folded by the engine; the
/// channel closing ends the stream. An `Err` return means the message never
/// reached the runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn create_session(
        &self,
        workspace_id: &str,
        strategy: ExecutionStrategy,
    ) -> Result<Topic, RuntimeError>;

    async fn send_message(
        &self,
        message: OutboundMessage,
        events: mpsc::Sender<Value>,
    ) -> Result<(), RuntimeError>;

    async fn stop_session(&self, session_id: &str) -> Result<(), RuntimeError>;

    async fn confirm_action(
        &self,
        session_id: &str,
        request_id: &str,
        approved: bool,
        reason: &str,
    ) -> Result<(), RuntimeError>;

    async fn submit_elicitation(
        &self,
        session_id: &str,
        request_id: &str,
        response: Value,
    ) -> Result<(), RuntimeError>;

    async fn list_sessions(&self, workspace_id: &str) -> Result<Vec<Topic>, RuntimeError>;

    async fn rename_session(&self, session_id: &str, title: &str) -> Result<(), RuntimeError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), RuntimeError>;

    /// Stored transcript of one session, oldest record first
    async fn get_transcript(&self, session_id: &str) -> Result<Vec<RawMessage>, RuntimeError>;
}
