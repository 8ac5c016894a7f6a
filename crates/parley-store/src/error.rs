// ABOUTME: Error types for parley-store
// ABOUTME: Database, serialization and workspace-ownership failures

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session {session_id} belongs to workspace {owner}, not {requested}")]
    WorkspaceConflict {
        session_id: String,
        owner: String,
        requested: String,
    },
}
