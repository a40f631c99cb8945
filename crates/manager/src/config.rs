//! Manager configuration.
//!
//! Stored as TOML. The default store lives next to the user's data:
//! - Linux/macOS: `~/.local/share/blobferry/transfers.json`
//! - Windows: `%APPDATA%/blobferry/transfers.json`

use std::path::{Path, PathBuf};

use blobferry_model::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENCY};
use serde::{Deserialize, Serialize};

use crate::{ManagerError, NetworkPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Operations running at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// JSON file holding persisted transfers.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Capacity of the event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub upload_policy: NetworkPolicy,

    #[serde(default)]
    pub download_policy: NetworkPolicy,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_event_buffer() -> usize {
    256
}

fn default_store_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".into());
        PathBuf::from(appdata).join("blobferry").join("transfers.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("blobferry")
            .join("transfers.json")
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            chunk_size: default_chunk_size(),
            store_path: default_store_path(),
            event_buffer: default_event_buffer(),
            upload_policy: NetworkPolicy::default(),
            download_policy: NetworkPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Loads configuration from `path`, or creates and saves a default.
    pub fn load(path: &Path) -> Result<Self, ManagerError> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<ManagerConfig>(&content)?
        } else {
            let config = ManagerConfig::default();
            config.save(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ManagerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.chunk_size == 0 {
            return Err(ManagerError::Config("chunk_size must be greater than 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(ManagerError::Config("max_concurrency must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(ManagerError::Config("event_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
