//! Speech-to-text (STT) processing

use async_trait::async_trait;

use super::{AudioFrame, Recognizer, samples_to_wav};
use crate::{Error, Result};

/// Default Whisper-compatible endpoint
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const DEEPGRAM_BASE_URL: &str = "https://api.deepgram.com/v1";

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SttProvider {
    Whisper,
    Deepgram,
}

/// Transcribes speech to text
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create a new STT instance using an OpenAI-compatible Whisper endpoint
    ///
    /// `base_url` points at the API root (e.g. `https://api.openai.com/v1`
    /// or a local whisper server). The key may be empty for local servers.
    ///
    /// # Errors
    ///
    /// Returns error if the key is missing for the hosted OpenAI endpoint
    pub fn new_whisper(api_key: String, model: String, base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if api_key.is_empty() && base_url == OPENAI_BASE_URL {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
            provider: SttProvider::Whisper,
        })
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: DEEPGRAM_BASE_URL.to_string(),
            provider: SttProvider::Deepgram,
        })
    }

    /// Provider name for logs
    #[must_use]
    pub const fn provider_name(&self) -> &'static str {
        match self.provider {
            SttProvider::Whisper => "whisper",
            SttProvider::Deepgram => "deepgram",
        }
    }

    /// Transcribe WAV bytes to text
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    pub async fn transcribe_wav(&self, audio: &[u8], language: &str) -> Result<String> {
        let transcript = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(audio, language).await?,
            SttProvider::Deepgram => self.transcribe_deepgram(audio, language).await?,
        };
        Ok(transcript.trim().to_string())
    }

    async fn transcribe_whisper(&self, audio: &[u8], language: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Whisper transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if !language.is_empty() {
            form = form.text("language", language.to_string());
        }

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "Whisper request failed");
            e
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    async fn transcribe_deepgram(&self, audio: &[u8], language: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), language, "starting Deepgram transcription");

        let mut url = format!(
            "{}/listen?model={}&punctuate=true",
            self.base_url, self.model
        );
        if !language.is_empty() {
            url.push_str("&language=");
            url.push_str(language);
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: DeepgramResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Deepgram response");
            e
        })?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default();

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[async_trait]
impl Recognizer for SpeechToText {
    async fn transcribe(&self, frame: &AudioFrame, language: &str) -> Result<String> {
        if frame.channels != 1 {
            return Err(Error::Stt(format!(
                "recognizer expects mono audio, got {} channels",
                frame.channels
            )));
        }
        let wav = samples_to_wav(&frame.samples, frame.sample_rate)?;
        self.transcribe_wav(&wav, language).await
    }
}
