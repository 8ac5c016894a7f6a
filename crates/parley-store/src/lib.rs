// ABOUTME: Persistence for the parley chat engine
// ABOUTME: Key/value tiers, one-shot migrations, session and preference stores

pub mod error;
pub mod keys;
pub mod kv;
pub mod preferences;
pub mod session;

pub use error::{Result, StoreError};
pub use kv::{migrate_once, KeyValueStore, MemoryStore, Migration, SqliteStore, TieredStore};
pub use preferences::{ModelPreference, PreferenceStore};
pub use session::{LegacyKeys, SessionStore};
