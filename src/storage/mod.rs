//! Persistent storage
//!
//! Locates the platform configuration directory and persists engine settings.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access config directory: {0}")]
    ConfigDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application config directory
///
/// Returns the platform-specific configuration directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\Mandre\Mandre\config`
/// - macOS: `/Users/{user}/Library/Application Support/ai.Mandre.Mandre`
/// - Linux: `/home/{user}/.config/mandre`
pub fn get_config_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("ai", "Mandre", "Mandre")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| StorageError::ConfigDirError("Could not determine config directory".to_string()))
}
