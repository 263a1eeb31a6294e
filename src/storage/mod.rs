//! Persistent storage
//!
//! Configuration documents and model discovery.

use std::path::PathBuf;
use thiserror::Error;

pub mod config;
pub mod models;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid glob pattern: {0}")]
    PatternError(#[from] glob::PatternError),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\LLM-UI\LLM-UI`
/// - macOS: `/Users/{user}/Library/Application Support/com.LLM-UI.LLM-UI`
/// - Linux: `/home/{user}/.local/share/llm-ui`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "LLM-UI", "LLM-UI")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Initialize the storage directory structure
///
/// Creates `{data_dir}/models/`; the configuration file is written by the
/// config module on first save.
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(data_dir.join("models"))?;

    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(data_dir)
}
