//! Language model interface
//!
//! The model itself runs in an external service; `LanguageModel` is the seam
//! the turn pipeline calls through.

mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::{DEFAULT_HOST, OllamaClient, parse_model_names};

use crate::Result;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role-tagged message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters for one generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Sequences that end generation early
    pub stop: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 256,
            stop: Vec::new(),
        }
    }
}

/// Chat-style text generation
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate the assistant's next message
    ///
    /// `messages` holds the conversation so far, oldest first, ending with
    /// the new user message. The system prompt is passed separately.
    async fn chat(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String>;

    /// Model identifier for logs
    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("はい")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"はい"}"#);
    }

    #[test]
    fn test_sampling_defaults() {
        let sampling = SamplingConfig::default();
        assert!((sampling.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(sampling.max_tokens, 256);
        assert!(sampling.stop.is_empty());
    }
}
