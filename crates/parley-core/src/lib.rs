// ABOUTME: Conversation model and pure folding logic for the parley chat engine
// ABOUTME: Events in, messages out; no I/O happens in this crate

pub mod accumulator;
pub mod actions;
pub mod error;
pub mod event;
pub mod history;
pub mod models;
pub mod transcript;

pub use accumulator::{Fold, MessageAccumulator};
pub use actions::{ActionRegistry, PendingAction, Registration};
pub use error::EventParseError;
pub use event::{ActionRequest, StreamEvent};
pub use history::{normalize, RawMessage, RawPart, RawRole};
pub use models::*;
pub use transcript::to_raw;
