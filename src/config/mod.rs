//! Configuration management for Kamen
//!
//! Precedence is env > TOML file > built-in defaults.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::ContextConfig;
use crate::llm::{DEFAULT_HOST, SamplingConfig};
use crate::retry::RetryPolicy;
use crate::sanitize::SanitizerPolicy;
use crate::voice::SAMPLE_RATE;
use crate::{Error, Result};

pub use file::{ConfigFile, config_file_path, load_config_file, parse_config_file};

/// Longest allowed voice recording, in seconds
pub const MAX_CAPTURE_SECS: f32 = 300.0;

/// Default model, tuned for Japanese
pub const DEFAULT_MODEL: &str = "kangyufei/llama2:japanese";

/// Default system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "あなたは親切で知識豊富な日本語のアシスタントです。
以下のルールに従って回答してください：
1. 常に正しい日本語のみで回答する
2. 英語や数字の羅列は使わない
3. 簡潔で自然な会話を心がける
4. 丁寧語を使用する
5. ユーザーの質問に直接答える
6. 文字化けや意味不明な文字は絶対に出力しない

日本の文化、習慣、言語について質問された場合は、正確で分かりやすい情報を提供してください。";

/// Kamen configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database, synthesized audio)
    pub data_dir: PathBuf,

    /// Language model configuration
    pub llm: LlmConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Context window configuration
    pub context: ContextConfig,

    /// Reply character policy
    pub sanitizer: SanitizerPolicy,

    /// Database configuration
    pub storage: StorageConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Ollama server address
    pub host: String,

    /// Model identifier
    pub model: String,

    /// System prompt sent with every turn
    pub system_prompt: String,

    /// Sampling parameters
    pub sampling: SamplingConfig,

    /// Per-request timeout
    pub timeout: Duration,

    /// Pull the model on startup when it is not installed
    pub auto_pull: bool,

    /// Retry policy for recognition, generation and synthesis calls
    pub retry: RetryPolicy,
}

/// Speech recognition backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

/// Speech synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Enable voice input and spoken replies
    pub enabled: bool,

    /// Recognition language hint
    pub language: String,

    /// Recognizer input sample rate
    pub sample_rate: u32,

    /// Recording length for a voice turn
    pub capture_duration: Duration,

    pub stt_provider: SttProvider,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// Whisper-compatible API root
    pub stt_base_url: String,

    pub tts_provider: TtsProvider,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,

    /// Where synthesized audio files are written
    pub output_dir: PathBuf,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database file path
    pub db_path: PathBuf,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (for Whisper and TTS)
    pub openai: Option<String>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<String>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<String>,
}

/// Default data directory (`~/.local/share/kamen` on Linux)
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(|| PathBuf::from("data"), |d| d.data_dir().join("kamen"))
}

fn parse_stt_provider(value: &str) -> Result<SttProvider> {
    match value.to_ascii_lowercase().as_str() {
        "whisper" | "openai" => Ok(SttProvider::Whisper),
        "deepgram" => Ok(SttProvider::Deepgram),
        other => Err(Error::Config(format!("unknown STT provider: {other}"))),
    }
}

fn parse_tts_provider(value: &str) -> Result<TtsProvider> {
    match value.to_ascii_lowercase().as_str() {
        "openai" => Ok(TtsProvider::OpenAI),
        "elevenlabs" => Ok(TtsProvider::ElevenLabs),
        other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is unreadable or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or the capture length is invalid
    #[allow(clippy::too_many_lines)]
    pub fn from_sources(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|s| s.trim().parse::<f64>().ok());

        let data_dir = env("KAMEN_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        // LLM config (env > toml > default)
        let defaults = SamplingConfig::default();
        #[allow(clippy::cast_possible_truncation)]
        let temperature = env_parse("KAMEN_TEMPERATURE")
            .map(|t| t as f32)
            .or(fc.llm.temperature)
            .unwrap_or(defaults.temperature);
        let max_tokens = env("KAMEN_MAX_TOKENS")
            .and_then(|s| s.trim().parse().ok())
            .or(fc.llm.max_tokens)
            .unwrap_or(defaults.max_tokens);

        let retry_attempts = fc.llm.retry_attempts.unwrap_or(RetryPolicy::default().max_attempts);
        let llm = LlmConfig {
            host: env("OLLAMA_HOST")
                .or(fc.llm.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            model: env("KAMEN_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: fc
                .llm
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            sampling: SamplingConfig {
                temperature,
                max_tokens,
                stop: fc.llm.stop.unwrap_or_default(),
            },
            timeout: Duration::from_secs(fc.llm.timeout_secs.unwrap_or(120)),
            auto_pull: fc.llm.auto_pull.unwrap_or(true),
            retry: RetryPolicy {
                max_attempts: retry_attempts.max(1),
                ..RetryPolicy::default()
            },
        };

        // Voice config (env > toml > default)
        let stt_provider = env("KAMEN_STT_PROVIDER")
            .or(fc.voice.stt_provider)
            .map_or(Ok(SttProvider::Whisper), |p| parse_stt_provider(&p))?;
        let tts_provider = env("KAMEN_TTS_PROVIDER")
            .or(fc.voice.tts_provider)
            .map_or(Ok(TtsProvider::OpenAI), |p| parse_tts_provider(&p))?;

        let capture_secs = fc.voice.capture_secs.unwrap_or(5.0);
        if !(capture_secs > 0.0 && capture_secs <= MAX_CAPTURE_SECS) {
            return Err(Error::Config(format!(
                "capture_secs must be in (0, {MAX_CAPTURE_SECS}], got {capture_secs}"
            )));
        }
        let capture_duration = Duration::try_from_secs_f32(capture_secs)
            .map_err(|e| Error::Config(format!("capture_secs: {e}")))?;

        let voice = VoiceConfig {
            enabled: env("KAMEN_VOICE")
                .and_then(|v| parse_bool(&v))
                .or(fc.voice.enabled)
                .unwrap_or(true),
            language: env("KAMEN_LANGUAGE")
                .or(fc.voice.language)
                .unwrap_or_else(|| "ja".to_string()),
            sample_rate: fc.voice.sample_rate.unwrap_or(SAMPLE_RATE),
            capture_duration,
            stt_provider,
            stt_model: env("KAMEN_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| match stt_provider {
                    SttProvider::Whisper => "whisper-1".to_string(),
                    SttProvider::Deepgram => "nova-2".to_string(),
                }),
            stt_base_url: env("KAMEN_STT_BASE_URL")
                .or(fc.voice.stt_base_url)
                .unwrap_or_else(|| crate::voice::OPENAI_BASE_URL.to_string()),
            tts_provider,
            tts_model: env("KAMEN_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| match tts_provider {
                    TtsProvider::OpenAI => "tts-1".to_string(),
                    TtsProvider::ElevenLabs => "eleven_multilingual_v2".to_string(),
                }),
            tts_voice: env("KAMEN_TTS_VOICE")
                .or(fc.voice.tts_voice)
                .unwrap_or_else(|| "alloy".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or(1.0).clamp(0.25, 4.0),
            output_dir: fc
                .voice
                .output_dir
                .map_or_else(|| data_dir.join("temp_audio"), PathBuf::from),
        };

        // Sanitizer policy (toml > default)
        let policy_defaults = SanitizerPolicy::default();
        let sanitizer = SanitizerPolicy {
            min_length: fc.sanitizer.min_length.unwrap_or(policy_defaults.min_length),
            min_script_chars: fc
                .sanitizer
                .min_script_chars
                .unwrap_or(policy_defaults.min_script_chars),
            fallback: fc.sanitizer.fallback.unwrap_or(policy_defaults.fallback),
        };

        let storage = StorageConfig {
            db_path: env("KAMEN_DB_PATH")
                .or(fc.storage.db_path)
                .map_or_else(|| data_dir.join("conversations.db"), PathBuf::from),
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
            deepgram: env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram),
            elevenlabs: env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
        };

        Ok(Self {
            data_dir,
            llm,
            voice,
            context: fc.context.unwrap_or_default(),
            sanitizer,
            storage,
            api_keys,
        })
    }

    /// Built-in defaults with no file and no environment
    ///
    /// # Errors
    ///
    /// Never fails for the built-in values; kept fallible to match `load`
    pub fn defaults() -> Result<Self> {
        Self::from_sources(ConfigFile::default(), |_| None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::defaults().unwrap();

        assert_eq!(config.llm.model, DEFAULT_MODEL);
        assert_eq!(config.llm.host, DEFAULT_HOST);
        assert!((config.llm.sampling.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.llm.sampling.max_tokens, 256);
        assert_eq!(config.llm.retry.max_attempts, 2);
        assert_eq!(config.voice.language, "ja");
        assert_eq!(config.voice.sample_rate, 16000);
        assert_eq!(config.voice.capture_duration, Duration::from_secs(5));
        assert_eq!(config.context.max_exchanges, 10);
        assert_eq!(config.sanitizer, SanitizerPolicy::default());
        assert!(config.storage.db_path.ends_with("conversations.db"));
        assert!(config.voice.output_dir.ends_with("temp_audio"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let fc = parse_config_file(
            r#"
            data_dir = "/tmp/kamen-test"

            [llm]
            model = "llama3"
            max_tokens = 512

            [voice]
            stt_provider = "deepgram"

            [sanitizer]
            min_length = 4
            "#,
        )
        .unwrap();

        let config = Config::from_sources(fc, |_| None).unwrap();

        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.llm.sampling.max_tokens, 512);
        assert_eq!(config.voice.stt_provider, SttProvider::Deepgram);
        assert_eq!(config.voice.stt_model, "nova-2");
        assert_eq!(config.sanitizer.min_length, 4);
        assert_eq!(
            config.storage.db_path,
            PathBuf::from("/tmp/kamen-test/conversations.db")
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = parse_config_file("[llm]\nmodel = \"from-file\"\ntemperature = 0.9\n").unwrap();
        let env = env_from(&[
            ("KAMEN_MODEL", "from-env"),
            ("KAMEN_TEMPERATURE", "0.1"),
            ("OLLAMA_HOST", "http://gpu:11434"),
            ("OPENAI_API_KEY", "sk-test"),
            ("KAMEN_VOICE", "off"),
        ]);

        let config = Config::from_sources(fc, env).unwrap();

        assert_eq!(config.llm.model, "from-env");
        assert!((config.llm.sampling.temperature - 0.1).abs() < 1e-6);
        assert_eq!(config.llm.host, "http://gpu:11434");
        assert_eq!(config.api_keys.openai.as_deref(), Some("sk-test"));
        assert!(!config.voice.enabled);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let env = env_from(&[("KAMEN_TTS_PROVIDER", "festival")]);
        let result = Config::from_sources(ConfigFile::default(), env);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_capture_length_rejected() {
        let fc = parse_config_file("[voice]\ncapture_secs = 0.0\n").unwrap();
        assert!(Config::from_sources(fc, |_| None).is_err());
    }

    #[test]
    fn test_huge_capture_length_rejected() {
        for value in ["1e30", "301.0", "inf", "nan"] {
            let fc = parse_config_file(&format!("[voice]\ncapture_secs = {value}\n")).unwrap();
            assert!(
                matches!(Config::from_sources(fc, |_| None), Err(Error::Config(_))),
                "capture_secs = {value} should be rejected"
            );
        }

        let fc = parse_config_file("[voice]\ncapture_secs = 300.0\n").unwrap();
        let config = Config::from_sources(fc, |_| None).unwrap();
        assert_eq!(config.voice.capture_duration, Duration::from_secs(300));
    }

    #[test]
    fn test_retry_attempts_floor_at_one() {
        let fc = parse_config_file("[llm]\nretry_attempts = 0\n").unwrap();
        let config = Config::from_sources(fc, |_| None).unwrap();
        assert_eq!(config.llm.retry.max_attempts, 1);
    }
}
