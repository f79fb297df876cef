//! Engine configuration, read from `quest_engine.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::quest::engine::EngineOptions;

/// Env var that overrides the config file location
pub const CONFIG_PATH_VAR: &str = "QUEST_ENGINE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "quest_engine.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of `quests/` and `scripts/steps/`
    pub data_dir: PathBuf,
    pub database_url: String,
    /// When false every quest starts fresh
    pub load_saved_state: bool,
    pub save_on_transition: bool,
    pub tick_interval_ms: u64,
    pub autosave_interval_secs: u64,
    pub starting_level: i32,
    pub starting_max_experience: i32,
    /// Watch quest files for changes (debug builds only)
    pub hot_reload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_url: "sqlite:quests.db?mode=rwc".to_string(),
            load_saved_state: true,
            save_on_transition: true,
            tick_interval_ms: 50,
            autosave_interval_secs: 30,
            starting_level: 1,
            starting_max_experience: 100,
            hot_reload: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        if !path.exists() {
            info!("No config at {}, using defaults", shown);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: shown.clone(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&shown, &content)
    }

    /// Load from `$QUEST_ENGINE_CONFIG`, or `quest_engine.toml`
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs.max(1))
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            load_saved_state: self.load_saved_state,
            save_on_transition: self.save_on_transition,
            player_level: self.starting_level,
        }
    }
}
