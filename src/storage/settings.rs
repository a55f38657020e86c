//! Settings storage
//!
//! Reads and writes the engine configuration file. Loading returns the raw
//! JSON so it goes through the same validated configure path as any other
//! update.

use crate::storage::{get_config_dir, StorageError};
use crate::types::EngineConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the engine config file
pub fn config_path() -> Result<PathBuf, StorageError> {
    Ok(get_config_dir()?.join("engine.json"))
}

/// Reads a config file. A missing file is not an error.
pub fn load_config_json(path: &Path) -> Result<Option<String>, StorageError> {
    if !path.exists() {
        tracing::debug!("No config file at {}", path.display());
        return Ok(None);
    }
    let json = fs::read_to_string(path)?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(Some(json))
}

/// Save config to disk
pub fn save_config(path: &Path, config: &EngineConfig) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::info!("Saved engine config to {}", path.display());
    Ok(())
}
