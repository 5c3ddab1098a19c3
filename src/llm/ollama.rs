//! Ollama chat backend

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ChatMessage, LanguageModel, SamplingConfig};
use crate::{Error, Result};

/// Default Ollama endpoint
pub const DEFAULT_HOST: &str = "http://localhost:11434";

/// Pulls can take minutes on a cold cache
const PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions<'a> {
    temperature: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaPullRequest<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaPullResponse {
    #[serde(default)]
    status: String,
}

/// Client for a local or remote Ollama server
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaClient {
    /// Create a client for `model` on `host`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(host: &str, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Server address
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether an installed model name refers to the configured model
    ///
    /// An omitted tag and `:latest` are the same model.
    #[must_use]
    pub fn is_configured_model(&self, installed: &str) -> bool {
        model_matches(installed, &self.model)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{path}", self.host)
    }

    /// Names of the models installed on the server
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self.client.get(self.api_url("/tags")).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        Ok(parse_model_names(&body))
    }

    /// Download `model` to the server, waiting for completion
    ///
    /// # Errors
    ///
    /// Returns error if the pull request fails
    pub async fn pull_model(&self, model: &str) -> Result<()> {
        tracing::info!(model, "pulling model");

        let response = self
            .client
            .post(self.api_url("/pull"))
            .timeout(PULL_TIMEOUT)
            .json(&OllamaPullRequest {
                name: model,
                stream: false,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: OllamaPullResponse = response.json().await?;
        tracing::info!(model, status = %result.status, "model pull finished");
        Ok(())
    }

    /// Whether the configured model is installed
    ///
    /// Tags are matched loosely: `llama2` matches `llama2:latest`.
    ///
    /// # Errors
    ///
    /// Returns error if the server cannot be reached
    pub async fn has_model(&self) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|name| self.is_configured_model(name)))
    }

    /// Make sure the configured model is available, pulling it if missing
    ///
    /// Returns `true` when a pull was performed.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the pull fails
    pub async fn ensure_model_ready(&self) -> Result<bool> {
        if self.has_model().await? {
            tracing::debug!(model = %self.model, "model available");
            return Ok(false);
        }

        tracing::warn!(model = %self.model, "model not installed, pulling");
        self.pull_model(&self.model).await?;
        Ok(true)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn chat(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        sampling: &SamplingConfig,
    ) -> Result<String> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            all.push(ChatMessage::system(system_prompt));
        }
        all.extend_from_slice(messages);

        let request = OllamaChatRequest {
            model: &self.model,
            messages: all,
            stream: false,
            options: OllamaOptions {
                temperature: sampling.temperature,
                num_predict: sampling.max_tokens,
                stop: &sampling.stop,
            },
        };

        tracing::debug!(model = %self.model, messages = request.messages.len(), "sending chat request");

        let response = self
            .client
            .post(self.api_url("/chat"))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Ollama API error");
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: OllamaChatResponse = response.json().await?;
        tracing::debug!(tokens = result.eval_count.unwrap_or(0), "chat response received");

        let content = result.message.content.trim().to_string();
        if content.is_empty() {
            return Err(Error::Generation("model returned an empty reply".to_string()));
        }
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Flatten any known model-listing response into a list of names
///
/// Accepted shapes:
/// - `{"models": [{"name": ".."}]}`
/// - `{"models": [{"model": ".."}]}`
/// - `[{"name": ".."}]` or `[{"model": ".."}]`
/// - `[".."]` or `{"models": [".."]}`
///
/// Entries that carry no name are skipped.
#[must_use]
pub fn parse_model_names(body: &Value) -> Vec<String> {
    let entries: &[Value] = match body {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("models") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.as_str()),
            Value::Object(obj) => obj
                .get("name")
                .or_else(|| obj.get("model"))
                .and_then(Value::as_str),
            _ => None,
        })
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn model_matches(installed: &str, wanted: &str) -> bool {
    if installed == wanted {
        return true;
    }
    let strip = |s: &str| s.strip_suffix(":latest").unwrap_or(s).to_string();
    strip(installed) == strip(wanted)
}
