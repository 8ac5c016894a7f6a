// ABOUTME: Engine configuration file handling
// ABOUTME: TOML config with env var and .env support

use crate::error::{EngineError, Result};
use parley_core::actions::DEFAULT_ASK_TOOL_PATTERN;
use parley_core::ExecutionStrategy;
use parley_store::TieredStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DB_FILE: &str = "parley.db";

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Strategy used by workspaces that never chose one
    #[serde(default)]
    pub default_execution_strategy: ExecutionStrategy,
    /// Tool names matching this regex get a fallback ask_user prompt
    #[serde(default = "default_ask_tool_pattern")]
    pub ask_tool_pattern: String,
    /// Case-insensitive substrings that mark an error as rate limiting
    #[serde(default = "default_rate_limit_markers")]
    pub rate_limit_markers: Vec<String>,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Reason sent with confirmations approved by the auto strategy
    #[serde(default = "default_auto_confirm_reason")]
    pub auto_confirm_reason: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_execution_strategy: ExecutionStrategy::default(),
            ask_tool_pattern: default_ask_tool_pattern(),
            rate_limit_markers: default_rate_limit_markers(),
            event_channel_capacity: default_event_channel_capacity(),
            auto_confirm_reason: default_auto_confirm_reason(),
        }
    }
}

impl EngineConfig {
    /// Whether an error message reports rate limiting
    pub fn is_rate_limited(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.rate_limit_markers
            .iter()
            .any(|marker| !marker.is_empty() && lower.contains(&marker.to_lowercase()))
    }
}

fn default_ask_tool_pattern() -> String {
    DEFAULT_ASK_TOOL_PATTERN.to_string()
}

fn default_rate_limit_markers() -> Vec<String> {
    ["rate limit", "rate_limit", "ratelimit", "too many requests", "429"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_auto_confirm_reason() -> String {
    "approved by auto execution strategy".to_string()
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Directory holding the durable store; defaults to the platform data dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load config with precedence: CLI > env > .env > file > defaults
    pub fn load(data_dir_override: Option<&Path>) -> Result<Self> {
        // Load .env file if present (silently ignore if missing)
        let _ = dotenvy::dotenv();

        let mut config = match Self::config_path() {
            Ok(path) => Self::load_from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());

        if let Some(dir) = data_dir_override {
            config.storage.data_dir = Some(dir.to_path_buf());
        }
        Ok(config)
    }

    /// Apply `PARLEY_*` overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("PARLEY_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(strategy) = lookup("PARLEY_EXECUTION_STRATEGY") {
            match strategy.parse() {
                Ok(strategy) => self.engine.default_execution_strategy = strategy,
                Err(e) => tracing::warn!(error = %e, "ignoring PARLEY_EXECUTION_STRATEGY"),
            }
        }
        if let Some(pattern) = lookup("PARLEY_ASK_TOOL_PATTERN") {
            self.engine.ask_tool_pattern = pattern;
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml_str(&content)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)
            .map_err(|e| EngineError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| EngineError::Config("Could not find config directory".to_string()))?;
        Ok(config_dir.join("parley").join("config.toml"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| EngineError::Config("Could not find data directory".to_string()))?;
        Ok(data_dir.join("parley"))
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DB_FILE))
    }

    /// Open the tiered store under the data dir, creating the directory
    pub async fn open_store(&self) -> Result<TieredStore> {
        let dir = self.data_dir()?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Config(format!("Failed to create data dir: {}", e)))?;
        Ok(TieredStore::open(dir.join(DB_FILE)).await?)
    }
}
