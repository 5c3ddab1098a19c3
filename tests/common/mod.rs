//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kamen::{
    AudioFrame, AudioSource, ChatMessage, Error, LanguageModel, Recognizer, Result, RetryPolicy,
    SamplingConfig, SessionStore, Synthesizer, TurnConfig, db,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Set up an in-memory session store
#[must_use]
pub fn setup_store() -> SessionStore {
    SessionStore::new(db::init_memory().expect("failed to init test db"))
}

/// Retry policy that keeps failing tests fast
#[must_use]
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

/// Turn parameters for tests: fast retries, speaking enabled
#[must_use]
pub fn test_turn_config() -> TurnConfig {
    TurnConfig {
        retry: fast_retry(),
        capture_duration: Duration::from_millis(10),
        ..TurnConfig::default()
    }
}

/// Language model returning scripted replies in order
///
/// When the script runs out the last reply is repeated.
pub struct MockLlm {
    replies: Mutex<VecDeque<Result<String>>>,
    last: String,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        let last = replies.last().map_or_else(String::new, |r| (*r).to_string());
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
            last,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Model that always fails with a non-retryable error
    pub fn failing() -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Err(Error::Generation(
                "model offline".to_string(),
            ))])),
            last: String::new(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages passed on each call
    pub async fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl LanguageModel for MockLlm {
    async fn chat(
        &self,
        _system_prompt: &str,
        messages: &[ChatMessage],
        _sampling: &SamplingConfig,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push(messages.to_vec());

        let mut replies = self.replies.lock().await;
        match replies.pop_front() {
            Some(Err(e)) => {
                // Keep failing on every call
                replies.push_front(Err(Error::Generation(e.to_string())));
                Err(e)
            }
            Some(Ok(reply)) => Ok(reply),
            None => Ok(self.last.clone()),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// Model that blocks until cancelled
pub struct HangingLlm;

#[async_trait]
impl LanguageModel for HangingLlm {
    async fn chat(
        &self,
        _system_prompt: &str,
        _messages: &[ChatMessage],
        _sampling: &SamplingConfig,
    ) -> Result<String> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    fn model_name(&self) -> &str {
        "hanging"
    }
}

/// Recognizer returning a fixed transcript
pub struct MockRecognizer {
    transcript: Result<String>,
    calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: Ok(transcript.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            transcript: Err(Error::Stt("engine offline".to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn transcribe(&self, frame: &AudioFrame, _language: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(frame.channels, 1, "recognizer must receive mono audio");
        match &self.transcript {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(Error::Stt(e.to_string())),
        }
    }
}

/// How a mock synthesizer misbehaves
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SynthFailure {
    None,
    Synthesis,
    Playback,
}

/// Synthesizer recording what it was asked to say
///
/// Each reply is written as a real file in a private temp directory.
pub struct MockSynthesizer {
    dir: tempfile::TempDir,
    texts: Mutex<Vec<String>>,
    paths: Mutex<Vec<PathBuf>>,
    failure: SynthFailure,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::with_failure(SynthFailure::None)
    }

    pub fn with_failure(failure: SynthFailure) -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
            texts: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            failure,
        }
    }

    pub fn failing() -> Self {
        Self::with_failure(SynthFailure::Synthesis)
    }

    pub async fn texts(&self) -> Vec<String> {
        self.texts.lock().await.clone()
    }

    /// Files handed out by `synthesize`
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().await.clone()
    }

    /// Files still present in the output directory
    pub fn remaining_files(&self) -> usize {
        std::fs::read_dir(self.dir.path()).map_or(0, Iterator::count)
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        let mut texts = self.texts.lock().await;
        texts.push(text.to_string());
        if self.failure == SynthFailure::Synthesis {
            return Err(Error::Synthesis("engine offline".to_string()));
        }

        let path = self.dir.path().join(format!("reply_{}.mp3", texts.len()));
        tokio::fs::write(&path, b"ID3").await?;
        self.paths.lock().await.push(path.clone());
        Ok(path)
    }

    async fn play(&self, path: &Path) -> Result<()> {
        assert!(path.exists(), "played file must exist");
        if self.failure == SynthFailure::Playback {
            return Err(Error::Synthesis("no output device".to_string()));
        }
        Ok(())
    }
}

/// Synthesizer whose playback never finishes
pub struct EndlessPlayback {
    pub inner: MockSynthesizer,
}

#[async_trait]
impl Synthesizer for EndlessPlayback {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        self.inner.synthesize(text).await
    }

    async fn play(&self, _path: &Path) -> Result<()> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Audio source producing a stereo 44.1kHz tone
pub struct MockAudioSource;

#[async_trait]
impl AudioSource for MockAudioSource {
    async fn capture(&self, _duration: Duration, _cancel: &CancellationToken) -> Result<AudioFrame> {
        #[allow(clippy::cast_precision_loss)]
        let samples: Vec<f32> = (0..4410)
            .flat_map(|i| {
                let s = (i as f32 * 0.05).sin() * 0.5;
                [s, s]
            })
            .collect();
        Ok(AudioFrame {
            samples,
            sample_rate: 44_100,
            channels: 2,
        })
    }
}

/// Audio source that records nothing
pub struct SilentSource;

#[async_trait]
impl AudioSource for SilentSource {
    async fn capture(&self, _duration: Duration, _cancel: &CancellationToken) -> Result<AudioFrame> {
        Ok(AudioFrame::mono(Vec::new(), 16_000))
    }
}

/// Audio source whose device is missing
pub struct BrokenSource;

#[async_trait]
impl AudioSource for BrokenSource {
    async fn capture(&self, _duration: Duration, _cancel: &CancellationToken) -> Result<AudioFrame> {
        Err(Error::CaptureUnavailable("no input device available".to_string()))
    }
}
