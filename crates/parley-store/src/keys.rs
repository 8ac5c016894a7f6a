// ABOUTME: Key layout of the persisted state
// ABOUTME: Everything a workspace owns lives under its `ws:<id>:` prefix

/// Unscoped keys written before workspaces existed
pub const LEGACY_CURRENT_SESSION: &str = "session.current";
pub const LEGACY_MESSAGES: &str = "messages";
pub const LEGACY_PROVIDER: &str = "pref.provider";
pub const LEGACY_MODEL: &str = "pref.model";
pub const LEGACY_EXECUTION_STRATEGY: &str = "pref.execution_strategy";

pub const LEGACY_KEYS: [&str; 5] = [
    LEGACY_CURRENT_SESSION,
    LEGACY_MESSAGES,
    LEGACY_PROVIDER,
    LEGACY_MODEL,
    LEGACY_EXECUTION_STRATEGY,
];

pub fn workspace_prefix(workspace: &str) -> String {
    format!("ws:{workspace}:")
}

/// Scoped form of a legacy (or any workspace-relative) key
pub fn scoped(workspace: &str, key: &str) -> String {
    format!("ws:{workspace}:{key}")
}

pub fn current_session(workspace: &str) -> String {
    scoped(workspace, LEGACY_CURRENT_SESSION)
}

pub fn messages(workspace: &str) -> String {
    scoped(workspace, LEGACY_MESSAGES)
}

pub fn provider(workspace: &str) -> String {
    scoped(workspace, LEGACY_PROVIDER)
}

pub fn model(workspace: &str) -> String {
    scoped(workspace, LEGACY_MODEL)
}

pub fn execution_strategy(workspace: &str) -> String {
    scoped(workspace, LEGACY_EXECUTION_STRATEGY)
}

pub fn topic_preference(workspace: &str, topic: &str) -> String {
    format!("ws:{workspace}:topic:{topic}:pref")
}

/// Global: which workspace a session belongs to
pub fn session_owner(session: &str) -> String {
    format!("session:{session}:workspace")
}

pub fn migration_marker(id: &str) -> String {
    format!("migration:{id}")
}
