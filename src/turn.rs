//! Conversation turn pipeline
//!
//! One turn runs capture, transcription, context building, generation,
//! sanitization, persistence and synthesis strictly in sequence. Only capture
//! and transcription can fail a turn; every later stage degrades instead.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DEFAULT_SYSTEM_PROMPT};
use crate::context::{ContextBuilder, ContextWindow};
use crate::db::SessionStore;
use crate::db::session::Metadata;
use crate::llm::{LanguageModel, SamplingConfig};
use crate::retry::{RetryPolicy, with_retry};
use crate::sanitize::TextSanitizer;
use crate::voice::{AudioNormalizer, AudioSource, Recognizer, Synthesizer};
use crate::{Error, Result};

/// Reply used when the language model fails or returns nothing
pub const GENERATION_APOLOGY: &str =
    "申し訳ございませんが、エラーが発生しました。もう一度お試しください。";

/// Why a turn ended without a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No capture device, or the device failed
    CaptureUnavailable,
    /// Recognition produced no transcript
    NoSpeechDetected,
    /// Typed input was blank
    EmptyInput,
    /// The turn's cancellation token fired before persisting
    Cancelled,
    /// The language model failed or replied with nothing; the turn goes on
    /// with the apology
    GenerationError,
}

/// Pipeline stage currently executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Capturing,
    Transcribing,
    ContextBuilding,
    Generating,
    Sanitizing,
    Persisting,
    Synthesizing,
    /// Last turn failed; the orchestrator accepts a new turn
    ///
    /// `Failed(GenerationError)` is the one non-terminal failure: it is
    /// published when the apology replaces the model's reply, and the
    /// remaining stages still run.
    Failed(FailureReason),
}

/// What the user supplied for a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    /// Typed text
    Text(String),
    /// Record from the audio source
    Voice,
}

impl TurnInput {
    const fn mode(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Voice => "voice",
        }
    }
}

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Session the exchange belongs to, if one could be created
    pub session_id: Option<String>,
    /// Transcript or typed text
    pub user_text: String,
    /// Sanitized reply
    pub reply: String,
    /// Why generation fell back to the apology, if it did
    pub generation_error: Option<String>,
    /// Whether the exchange was saved
    pub persisted: bool,
    /// Row id of the saved exchange
    pub exchange_id: Option<i64>,
    /// Whether the reply was synthesized and played to the end
    pub spoken: bool,
}

/// Per-turn parameters
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub system_prompt: String,
    pub sampling: SamplingConfig,
    /// Recognition language hint
    pub language: String,
    /// Recording length for voice turns
    pub capture_duration: Duration,
    /// Retry policy for external calls
    pub retry: RetryPolicy,
    /// Synthesize and play replies
    pub speak: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            sampling: SamplingConfig::default(),
            language: "ja".to_string(),
            capture_duration: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            speak: true,
        }
    }
}

impl TurnConfig {
    /// Turn parameters from the loaded configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.llm.system_prompt.clone(),
            sampling: config.llm.sampling.clone(),
            language: config.voice.language.clone(),
            capture_duration: config.voice.capture_duration,
            retry: config.llm.retry.clone(),
            speak: config.voice.enabled,
        }
    }
}

/// Runs conversation turns against one current session
pub struct TurnOrchestrator {
    store: SessionStore,
    context: ContextBuilder,
    sanitizer: TextSanitizer,
    normalizer: AudioNormalizer,
    llm: Arc<dyn LanguageModel>,
    recognizer: Option<Arc<dyn Recognizer>>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    audio_source: Option<Arc<dyn AudioSource>>,
    config: TurnConfig,
    session_id: Option<String>,
    state: watch::Sender<TurnState>,
}

impl TurnOrchestrator {
    /// Create an orchestrator for text turns
    ///
    /// Voice input and spoken replies are enabled by attaching a recognizer,
    /// audio source and synthesizer.
    #[must_use]
    pub fn new(store: SessionStore, llm: Arc<dyn LanguageModel>, config: TurnConfig) -> Self {
        let (state, _) = watch::channel(TurnState::Idle);
        Self {
            store,
            context: ContextBuilder::default(),
            sanitizer: TextSanitizer::default(),
            normalizer: AudioNormalizer::default(),
            llm,
            recognizer: None,
            synthesizer: None,
            audio_source: None,
            config,
            session_id: None,
            state,
        }
    }

    #[must_use]
    pub fn with_context_builder(mut self, context: ContextBuilder) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: TextSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: AudioNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn with_recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    #[must_use]
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    #[must_use]
    pub fn with_audio_source(mut self, source: Arc<dyn AudioSource>) -> Self {
        self.audio_source = Some(source);
        self
    }

    /// Current session, if one has been created or selected
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Backing store
    #[must_use]
    pub const fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Whether voice turns can run
    #[must_use]
    pub const fn voice_available(&self) -> bool {
        self.audio_source.is_some() && self.recognizer.is_some()
    }

    /// Turn spoken replies on or off
    pub const fn set_speak(&mut self, speak: bool) {
        self.config.speak = speak;
    }

    /// Current pipeline state
    #[must_use]
    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Watch pipeline state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Start a new session and make it current
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be created
    pub fn new_session(&mut self, title: Option<&str>) -> Result<String> {
        let id = self.store.create_session(title)?;
        self.session_id = Some(id.clone());
        Ok(id)
    }

    /// Make an existing session current
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the session does not exist
    pub fn select_session(&mut self, session_id: &str) -> Result<()> {
        if self.store.get_session(session_id)?.is_none() {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        self.session_id = Some(session_id.to_string());
        Ok(())
    }

    fn set_state(&self, state: TurnState) {
        self.state.send_replace(state);
        tracing::debug!(state = ?state, "turn state");
    }

    fn fail(&self, reason: FailureReason, error: Error) -> Error {
        self.state.send_replace(TurnState::Failed(reason));
        tracing::warn!(reason = ?reason, error = %error, "turn failed");
        error
    }

    /// Run one turn
    ///
    /// # Errors
    ///
    /// Returns `Error::CaptureUnavailable`, `Error::NoSpeechDetected`,
    /// `Error::EmptyInput` or `Error::Cancelled`; nothing is persisted in
    /// those cases. Generation, storage and synthesis failures are reported
    /// through the outcome instead.
    pub async fn run_turn(
        &mut self,
        input: TurnInput,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.set_state(TurnState::Idle);
        let mode = input.mode();

        let user_text = match input {
            TurnInput::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(self.fail(FailureReason::EmptyInput, Error::EmptyInput));
                }
                text.to_string()
            }
            TurnInput::Voice => self.listen(cancel).await?,
        };

        let session_id = self.ensure_session();

        self.set_state(TurnState::ContextBuilding);
        let window = session_id.as_deref().map_or_else(ContextWindow::default, |id| {
            self.context.build(&self.store, id).unwrap_or_else(|e| {
                tracing::warn!(error = %e, session_id = id, "context unavailable, continuing without history");
                ContextWindow::default()
            })
        });

        self.set_state(TurnState::Generating);
        let (raw_reply, generation_error) = match self.generate(&window, &user_text, cancel).await {
            Ok(reply) => (reply, None),
            Err(Error::Cancelled) => {
                return Err(self.fail(FailureReason::Cancelled, Error::Cancelled));
            }
            Err(e) => {
                tracing::error!(error = %e, model = self.llm.model_name(), "generation failed, replying with apology");
                self.state
                    .send_replace(TurnState::Failed(FailureReason::GenerationError));
                // Let subscribers observe the fallback before the next stage
                tokio::task::yield_now().await;
                (GENERATION_APOLOGY.to_string(), Some(e.to_string()))
            }
        };

        self.set_state(TurnState::Sanitizing);
        let reply = self.sanitizer.sanitize(&raw_reply);

        if cancel.is_cancelled() {
            return Err(self.fail(FailureReason::Cancelled, Error::Cancelled));
        }

        self.set_state(TurnState::Persisting);
        let mut exchange_id = None;
        if let Some(id) = session_id.as_deref() {
            let metadata = self.exchange_metadata(mode, generation_error.is_some());
            match self.store.save_exchange(id, &user_text, &reply, None, Some(&metadata)) {
                Ok(exchange) => {
                    tracing::info!(session_id = id, exchange_id = exchange.id, "exchange saved");
                    exchange_id = Some(exchange.id);
                }
                Err(Error::NotFound(_)) => {
                    // Deleted underneath us; a fresh session is created next turn
                    tracing::warn!(session_id = id, "session no longer exists, exchange not saved");
                    self.session_id = None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, session_id = id, "failed to save exchange");
                }
            }
        }

        let mut spoken = false;
        if self.config.speak {
            if let Some(synthesizer) = self.synthesizer.clone() {
                self.set_state(TurnState::Synthesizing);
                match self.speak(synthesizer.as_ref(), &reply, cancel).await {
                    Ok(()) => spoken = true,
                    Err(Error::Cancelled) => tracing::debug!("synthesis cancelled"),
                    Err(e) => tracing::warn!(error = %e, "speech synthesis failed"),
                }
            }
        }

        self.set_state(TurnState::Idle);
        Ok(TurnOutcome {
            session_id,
            user_text,
            reply,
            generation_error,
            persisted: exchange_id.is_some(),
            exchange_id,
            spoken,
        })
    }

    /// Current session, creating one if none is selected
    ///
    /// A storage failure leaves the turn unsaved; creation is retried on the
    /// next turn.
    fn ensure_session(&mut self) -> Option<String> {
        if let Some(id) = &self.session_id {
            return Some(id.clone());
        }

        match self.store.create_session(None) {
            Ok(id) => {
                tracing::debug!(session_id = %id, "turn opened a new session");
                self.session_id = Some(id.clone());
                Some(id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not create session, turn will not be saved");
                None
            }
        }
    }

    /// Capture, normalize and transcribe one utterance
    async fn listen(&self, cancel: &CancellationToken) -> Result<String> {
        self.set_state(TurnState::Capturing);

        let Some(source) = self.audio_source.clone() else {
            return Err(self.fail(
                FailureReason::CaptureUnavailable,
                Error::CaptureUnavailable("no audio source configured".to_string()),
            ));
        };
        let Some(recognizer) = self.recognizer.clone() else {
            return Err(self.fail(
                FailureReason::CaptureUnavailable,
                Error::CaptureUnavailable("no speech recognizer configured".to_string()),
            ));
        };

        let captured = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            r = source.capture(self.config.capture_duration, cancel) => r,
        };
        let frame = match captured.and_then(|frame| self.normalizer.normalize(frame)) {
            Ok(frame) => frame,
            Err(Error::Cancelled) => {
                return Err(self.fail(FailureReason::Cancelled, Error::Cancelled));
            }
            Err(e) => {
                let error = match e {
                    Error::CaptureUnavailable(_) => e,
                    other => Error::CaptureUnavailable(other.to_string()),
                };
                return Err(self.fail(FailureReason::CaptureUnavailable, error));
            }
        };

        if frame.is_empty() {
            return Err(self.fail(FailureReason::NoSpeechDetected, Error::NoSpeechDetected));
        }

        self.set_state(TurnState::Transcribing);
        let language = self.config.language.as_str();
        let transcript = with_retry(&self.config.retry, cancel, "transcription", || {
            recognizer.transcribe(&frame, language)
        })
        .await;

        match transcript {
            Ok(text) if !text.trim().is_empty() => {
                let text = text.trim().to_string();
                tracing::info!(transcript = %text, "speech recognized");
                Ok(text)
            }
            Ok(_) => Err(self.fail(FailureReason::NoSpeechDetected, Error::NoSpeechDetected)),
            Err(Error::Cancelled) => Err(self.fail(FailureReason::Cancelled, Error::Cancelled)),
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
                Err(self.fail(FailureReason::NoSpeechDetected, Error::NoSpeechDetected))
            }
        }
    }

    /// Call the language model with the window and the new user text
    async fn generate(
        &self,
        window: &ContextWindow,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let messages = window.with_user_message(user_text);
        let llm = Arc::clone(&self.llm);

        let reply = with_retry(&self.config.retry, cancel, "generation", || {
            llm.chat(&self.config.system_prompt, &messages, &self.config.sampling)
        })
        .await?;

        if reply.trim().is_empty() {
            return Err(Error::Generation("model returned an empty reply".to_string()));
        }
        Ok(reply)
    }

    /// Synthesize and play the reply
    ///
    /// The synthesized file is removed afterwards whether playback finished,
    /// failed or was cancelled.
    async fn speak(
        &self,
        synthesizer: &dyn Synthesizer,
        reply: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = with_retry(&self.config.retry, cancel, "synthesis", || {
            synthesizer.synthesize(reply)
        })
        .await?;

        let played = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            r = synthesizer.play(&path) => r,
        };

        remove_reply_audio(&path).await;
        played
    }

    fn exchange_metadata(&self, mode: &str, fallback: bool) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("input".to_string(), mode.into());
        metadata.insert("model".to_string(), self.llm.model_name().into());
        if fallback {
            metadata.insert("generation_fallback".to_string(), true.into());
        }
        metadata
    }
}

async fn remove_reply_audio(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "reply audio removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove reply audio"),
    }
}
