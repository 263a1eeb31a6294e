//! Model discovery
//!
//! Lists candidate model files in the configured model directory.

use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Files at least this large are offered even without a `.gguf` extension
pub const LARGE_MODEL_BYTES: u64 = 100_000_000;

/// Information about a model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub last_modified: SystemTime,
}

impl ModelInfo {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        let bytes = self.size_bytes as f64;

        if bytes < 1024.0 {
            format!("{} B", bytes)
        } else if bytes < 1024.0 * 1024.0 {
            format!("{:.2} KB", bytes / 1024.0)
        } else if bytes < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.2} MB", bytes / (1024.0 * 1024.0))
        } else {
            format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
        }
    }
}

/// Scan a directory for model files
///
/// Picks every `*.gguf` file plus any other file of at least
/// [`LARGE_MODEL_BYTES`]. A missing directory yields an empty list.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut paths: Vec<PathBuf> = Vec::new();

    let escaped = glob::Pattern::escape(&directory.to_string_lossy());
    for entry in glob::glob(&format!("{}/*.gguf", escaped))? {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(e) => tracing::warn!("Unreadable glob entry: {}", e),
        }
    }

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() || paths.contains(&path) {
            continue;
        }
        match fs::metadata(&path) {
            Ok(meta) if meta.len() >= LARGE_MODEL_BYTES => paths.push(path),
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to stat {:?}: {}", path, e),
        }
    }

    let mut models = Vec::with_capacity(paths.len());
    for path in paths {
        match ModelInfo::from_path(path.clone()) {
            Ok(info) => {
                tracing::debug!("Found model: {}", info.filename);
                models.push(info);
            }
            Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));

    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());

    Ok(models)
}
