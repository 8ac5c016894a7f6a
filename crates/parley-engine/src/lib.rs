// ABOUTME: Agent chat session engine: one user intent in, a streamed multi-event exchange out
// ABOUTME: Owns per-session state, routes runtime events, persists workspace-scoped state

mod config;
mod dispatcher;
mod error;
mod runtime;
mod updates;

pub use config::{Config, EngineConfig, StorageConfig};
pub use dispatcher::{Answer, ConfirmResponse, Decision, StreamDispatcher};
pub use error::{EngineError, Result};
pub use runtime::{AgentRuntime, OutboundMessage, RuntimeError};
pub use updates::{EngineUpdate, Notice, NoticeLevel, StreamHandle, StreamProgress};

pub use parley_core as core;
pub use parley_store as store;
