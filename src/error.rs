//! Error types for Kamen

use thiserror::Error;

/// Result type alias for Kamen operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Kamen
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Capture device unavailable or capture failed
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Recognition produced no usable transcript
    #[error("no speech detected")]
    NoSpeechDetected,

    /// Typed input was blank
    #[error("empty input")]
    EmptyInput,

    /// Language model call failed or returned nothing
    #[error("generation error: {0}")]
    Generation(String),

    /// Audio buffer error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Synthesis or playback failed
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Turn aborted through its cancellation token
    #[error("turn cancelled")]
    Cancelled,

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream service answered with a non-success status
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether a failed external call is worth retrying
    ///
    /// Connection failures, timeouts, rate limits and server errors are
    /// transient; everything else fails immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| s.as_u16() == 429 || s.is_server_error())
            }
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}
