//! Voice processing module
//!
//! Audio capture, normalization, recognition, synthesis and playback. The
//! recognition and synthesis engines are external services reached through
//! the `Recognizer` and `Synthesizer` traits.

mod capture;
pub mod normalize;
mod playback;
mod stt;
mod tts;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use capture::{AudioCapture, MicrophoneSource, samples_to_wav};
pub use normalize::{AudioFrame, AudioNormalizer, RawSamples, SAMPLE_RATE};
pub use playback::{AudioPlayback, decode_audio_file};
pub use stt::{OPENAI_BASE_URL, SpeechToText};
pub use tts::TextToSpeech;

use crate::Result;

/// Source of raw captured audio
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Record for `duration`, returning early with `Error::Cancelled` when
    /// `cancel` fires
    async fn capture(&self, duration: Duration, cancel: &CancellationToken) -> Result<AudioFrame>;
}

/// Speech recognition engine
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Transcribe a normalized mono frame, hinting the spoken language
    async fn transcribe(&self, frame: &AudioFrame, language: &str) -> Result<String>;
}

/// Speech synthesis engine
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render `text` to an audio file and return its path
    ///
    /// The file belongs to the caller, which removes it after playback.
    async fn synthesize(&self, text: &str) -> Result<PathBuf>;

    /// Play a previously synthesized file to completion
    async fn play(&self, path: &Path) -> Result<()>;
}
