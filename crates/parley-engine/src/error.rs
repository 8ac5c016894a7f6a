// ABOUTME: Error types for parley-engine
// ABOUTME: Everything that changes what the user sees surfaces as an EngineError

use crate::runtime::RuntimeError;
use parley_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transport failed: {0}")]
    Transport(#[from] RuntimeError),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Confirmation of {request_id} failed: {source}")]
    Confirmation {
        request_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("No workspace selected")]
    WorkspaceMissing,

    #[error("Already streaming to this session")]
    AlreadyStreaming,

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action {0} is waiting for the runtime's request and cannot be answered yet")]
    FallbackAction(String),

    #[error("Session {session_id} belongs to workspace {owner}")]
    WorkspaceConflict { session_id: String, owner: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkspaceConflict {
                session_id, owner, ..
            } => EngineError::WorkspaceConflict { session_id, owner },
            other => EngineError::Store(other),
        }
    }
}
