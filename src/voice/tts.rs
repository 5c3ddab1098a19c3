//! Text-to-speech (TTS) processing

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{AudioPlayback, Synthesizer};
use crate::{Error, Result};

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

/// Synthesizes speech from text into files under an output directory
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
    output_dir: PathBuf,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(
        api_key: String,
        voice: String,
        speed: f32,
        model: String,
        output_dir: PathBuf,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            provider: TtsProvider::OpenAI,
            output_dir,
        })
    }

    /// Create a new TTS instance using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(
        api_key: String,
        voice_id: String,
        model: String,
        output_dir: PathBuf,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0,
            model,
            provider: TtsProvider::ElevenLabs,
            output_dir,
        })
    }

    /// Directory synthesized files are written to
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Synthesize text to MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn synthesize_bytes(&self, text: &str) -> Result<Vec<u8>> {
        match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await,
        }
    }

    async fn synthesize_openai(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status { status, body });
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

/// Write synthesized audio to a fresh file in `dir`
///
/// # Errors
///
/// Returns error if the directory or file cannot be written
pub async fn write_audio_file(dir: &Path, audio: &[u8], extension: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("reply_{}.{extension}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&path, audio).await?;
    Ok(path)
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        let audio = self
            .synthesize_bytes(text)
            .await
            .map_err(|e| match e {
                // Keep transient failures classifiable for retry
                Error::Status { .. } | Error::Http(_) => e,
                other => Error::Synthesis(other.to_string()),
            })?;

        if audio.is_empty() {
            return Err(Error::Synthesis("engine returned no audio".to_string()));
        }

        let path = write_audio_file(&self.output_dir, &audio, "mp3").await?;
        tracing::debug!(path = %path.display(), bytes = audio.len(), "speech synthesized");
        Ok(path)
    }

    async fn play(&self, path: &Path) -> Result<()> {
        // Dropping this future (e.g. on cancellation) stops the device thread
        let stop = CancellationToken::new();
        let _guard = stop.clone().drop_guard();
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let playback = AudioPlayback::new()?;
            playback.play_file_blocking(&path, &stop)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_requires_key() {
        let result = TextToSpeech::new_openai(
            String::new(),
            "alloy".to_string(),
            1.0,
            "tts-1".to_string(),
            PathBuf::from("temp_audio"),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_elevenlabs_requires_key() {
        let result = TextToSpeech::new_elevenlabs(
            String::new(),
            "voice".to_string(),
            "eleven_multilingual_v2".to_string(),
            PathBuf::from("temp_audio"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_audio_file_creates_unique_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("temp_audio");

        let a = write_audio_file(&out, b"abc", "mp3").await.unwrap();
        let b = write_audio_file(&out, b"def", "mp3").await.unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with(&out));
        assert_eq!(std::fs::read(&a).unwrap(), b"abc");
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("mp3"));
    }
}
