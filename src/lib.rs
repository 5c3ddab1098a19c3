//! Kamen - turn-based Japanese voice and text conversation assistant
//!
//! This library provides the conversation turn pipeline:
//! - Audio normalization for speech recognition
//! - Context windows built from persisted session history
//! - A Japanese character policy for generated replies
//! - Durable session and exchange storage
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Interfaces                       │
//! │         CLI chat loop   │   one-shot commands        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Turn Orchestrator                    │
//! │  Normalizer │ Context │ Sanitizer │ Session Store    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 External engines                     │
//! │   Ollama (LLM)  │  Whisper/Deepgram  │  OpenAI TTS   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod llm;
pub mod retry;
pub mod sanitize;
pub mod turn;
pub mod voice;

pub use config::Config;
pub use context::{ContextBuilder, ContextConfig, ContextWindow};
pub use db::{DbConn, DbPool, SessionStore};
pub use error::{Error, Result};
pub use llm::{ChatMessage, ChatRole, LanguageModel, OllamaClient, SamplingConfig};
pub use retry::RetryPolicy;
pub use sanitize::{SanitizerPolicy, TextSanitizer};
pub use turn::{
    FailureReason, GENERATION_APOLOGY, TurnConfig, TurnInput, TurnOrchestrator, TurnOutcome,
    TurnState,
};
pub use voice::{AudioFrame, AudioNormalizer, AudioSource, RawSamples, Recognizer, Synthesizer};
