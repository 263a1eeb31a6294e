//! Configuration storage
//!
//! Loads and saves the JSON configuration document: who is talking, which
//! model to load and the generation parameters of every character.

use crate::inference::controller::SessionSetup;
use crate::inference::params::GenerationParameters;
use crate::storage::{get_data_dir, StorageError};
use crate::types::Persona;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROMPT: &str = "Conversation between Bob the assistant and User\nUser:";
pub const DEFAULT_USER_NAME: &str = "User";
pub const DEFAULT_CHAR_NAME: &str = "Bob";
pub const DEFAULT_MODEL_DIR: &str = "models";
pub const DEFAULT_MODEL_FILE: &str = "ggml-model.bin";

/// One character slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterConfig {
    pub name: String,
    pub prompt: String,
    /// Prompt text file used while `prompt` is left at the default
    pub prompt_file: Option<PathBuf>,
    pub gpt_params: GenerationParameters,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CHAR_NAME.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            prompt_file: None,
            gpt_params: GenerationParameters::default(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub user_name: String,
    /// Directory searched for model files
    pub model_dir: PathBuf,
    pub model_file: String,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Derive keep counts from the first speaker tag in each prompt
    pub auto_n_keep: bool,
    pub characters: Vec<CharacterConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user_name: DEFAULT_USER_NAME.to_string(),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            model_file: DEFAULT_MODEL_FILE.to_string(),
            gpu_layers: 99, // Offload all layers to GPU by default
            auto_n_keep: false,
            characters: vec![CharacterConfig::default()],
        }
    }
}

impl AppConfig {
    /// Validate configuration values
    ///
    /// Fills blanks with defaults and clamps every character's parameters
    pub fn validate(&mut self) {
        if self.user_name.trim().is_empty() {
            self.user_name = DEFAULT_USER_NAME.to_string();
        }

        if self.model_file.is_empty() {
            self.model_file = DEFAULT_MODEL_FILE.to_string();
        }

        if self.characters.is_empty() {
            self.characters.push(CharacterConfig::default());
        }

        let user_tag = format!("{}:", self.user_name);
        for character in &mut self.characters {
            if character.name.trim().is_empty() {
                character.name = DEFAULT_CHAR_NAME.to_string();
            }
            // Treat "" as an empty value
            if character.prompt.is_empty() {
                character.prompt = DEFAULT_PROMPT.to_string();
            }
            character.gpt_params.validate();
            if character.gpt_params.antiprompt.is_empty() {
                character.gpt_params.antiprompt.push(user_tag.clone());
            }
        }
    }

    /// Full path of the configured model
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    /// Points the configuration at `path`, splitting it into directory and file
    pub fn set_model_path(&mut self, path: &Path) {
        self.model_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        self.model_file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
    }

    pub fn persona(&self, slot: usize) -> Option<Persona> {
        self.characters
            .get(slot)
            .map(|c| Persona::new(self.user_name.clone(), c.name.clone()))
    }

    /// Session setups for every character, in slot order
    pub fn session_setups(&self) -> Vec<SessionSetup> {
        let model_path = self.model_path();
        self.characters
            .iter()
            .enumerate()
            .map(|(slot, character)| SessionSetup {
                slot,
                model_path: model_path.clone(),
                params: character.gpt_params.clone(),
                speaker_tags: Persona::new(self.user_name.clone(), character.name.clone())
                    .speaker_tags(),
                auto_keep: self.auto_n_keep,
            })
            .collect()
    }

    /// Replaces default prompts with the contents of their prompt files
    fn resolve_prompt_files(&mut self, base: &Path) {
        for character in &mut self.characters {
            if character.prompt != DEFAULT_PROMPT {
                continue;
            }
            let Some(file) = &character.prompt_file else {
                continue;
            };
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base.join(file)
            };
            match fs::read_to_string(&path) {
                Ok(text) if !text.is_empty() => character.prompt = text,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to read prompt file {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("config.json"))
}

/// Load configuration from `path` (or the default location)
///
/// Returns the default configuration if the file doesn't exist or is corrupted
pub fn load_config(path: Option<&Path>) -> AppConfig {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match get_config_path() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Failed to locate config, using defaults: {}", e);
                return AppConfig::default();
            }
        },
    };

    if !path.exists() {
        tracing::info!("Config file not found, using defaults");
        let mut config = AppConfig::default();
        config.validate();
        return config;
    }

    match load_config_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            let mut config = AppConfig::default();
            config.validate();
            config
        }
    }
}

/// Strict configuration loading with error propagation
pub fn load_config_from(path: &Path) -> Result<AppConfig, StorageError> {
    tracing::info!("Loading configuration from: {}", path.display());
    let json = fs::read_to_string(path)?;
    let mut config: AppConfig = serde_json::from_str(&json)?;

    if let Some(base) = path.parent() {
        config.resolve_prompt_files(base);
    }
    config.validate();

    tracing::debug!(characters = config.characters.len(), "Loaded config from disk");
    Ok(config)
}

/// Save configuration to `path`
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {}", path.display());
    Ok(())
}
