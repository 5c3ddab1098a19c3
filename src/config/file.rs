//! TOML configuration file loading
//!
//! Supports `~/.config/kamen/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::context::ContextConfig;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Data directory override (database lives here by default)
    pub data_dir: Option<String>,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Context window configuration
    pub context: Option<ContextConfig>,

    /// Reply character policy
    #[serde(default)]
    pub sanitizer: SanitizerFileConfig,

    /// Database configuration
    #[serde(default)]
    pub storage: StorageFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Ollama server address
    pub host: Option<String>,
    /// Model identifier (e.g. "kangyufei/llama2:japanese")
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Pull the model on startup when missing
    pub auto_pull: Option<bool>,
    /// Attempts per external call, including the first
    pub retry_attempts: Option<u32>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable voice input/output
    pub enabled: Option<bool>,
    /// Recognition language hint (e.g. "ja")
    pub language: Option<String>,
    /// Recognizer input sample rate
    pub sample_rate: Option<u32>,
    /// Recording length for a voice turn, in seconds
    pub capture_secs: Option<f32>,
    /// "whisper" or "deepgram"
    pub stt_provider: Option<String>,
    pub stt_model: Option<String>,
    /// Whisper-compatible API root
    pub stt_base_url: Option<String>,
    /// "openai" or "elevenlabs"
    pub tts_provider: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_speed: Option<f32>,
    /// Where synthesized audio files are written
    pub output_dir: Option<String>,
}

/// Reply character policy
#[derive(Debug, Default, Deserialize)]
pub struct SanitizerFileConfig {
    pub min_length: Option<usize>,
    pub min_script_chars: Option<usize>,
    pub fallback: Option<String>,
}

/// Database configuration
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    /// Database file path
    pub db_path: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Parse a config file from TOML text
///
/// # Errors
///
/// Returns error if the text is not valid TOML for this schema
pub fn parse_config_file(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path
/// is tried and a missing or broken file falls back to defaults.
///
/// # Errors
///
/// Returns error if an explicit path cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config = parse_config_file(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(ConfigFile::default());
    };

    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(ConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(ConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/kamen/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("kamen").join("config.toml"))
}
