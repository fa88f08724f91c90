//! Ollama chat client (`/api/chat`, `/api/tags`, `/api/pull`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{CodeGenerator, SYSTEM_PROMPT, user_prompt};

const PROVIDER: &str = "ollama";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

/// Non-streaming Ollama client bound to one model.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self, LlmError> {
        // Generation on a cold model can take minutes.
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Build a client from configuration; the model must be set.
    pub fn from_config(config: &LlmConfig) -> Result<Self, anyhow::Error> {
        let model = config.require_model()?;
        Ok(Self::new(config.host.clone(), model)?)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request_failed(reason: impl ToString) -> LlmError {
        LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(Self::request_failed)?;

        if !response.status().is_success() {
            return Err(Self::request_failed(format!(
                "tags endpoint returned HTTP {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Poll the server every `interval` until it answers or `timeout` passes.
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), LlmError> {
        let poll = async {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::info!(url = %self.base_url, "Checking Ollama availability");
                match self.list_models().await {
                    Ok(_) => return,
                    Err(e) => tracing::debug!(error = %e, "Ollama not ready yet"),
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| LlmError::Unavailable {
                provider: PROVIDER.to_string(),
                timeout,
            })?;
        tracing::info!("Ollama is available");
        Ok(())
    }

    /// Whether the configured model is already present on the server.
    pub async fn has_model(&self) -> Result<bool, LlmError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|name| {
            name == &self.model || name.strip_suffix(":latest") == Some(self.model.as_str())
        }))
    }

    /// Pull the configured model, blocking until the server reports completion.
    pub async fn pull_model(&self) -> Result<(), LlmError> {
        tracing::info!(model = %self.model, "Pulling model");
        let response = self
            .client
            .post(self.url("/api/pull"))
            .json(&PullRequest {
                model: &self.model,
                stream: false,
            })
            .send()
            .await
            .map_err(Self::request_failed)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::request_failed(format!("HTTP {}: {}", status, body)));
        }
        tracing::info!(model = %self.model, "Model pulled");
        Ok(())
    }
}

#[async_trait]
impl CodeGenerator for OllamaClient {
    async fn generate_code(&self, problem: &str, language: &str) -> Result<String, LlmError> {
        let prompt = user_prompt(problem, language);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            stream: false,
        };

        tracing::debug!(model = %self.model, language = %language, "Requesting solution");

        let response = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(Self::request_failed)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Self::request_failed(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Self::request_failed(format!("HTTP {}: {}", status, text)));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: format!("JSON parse error: {}", e),
            })?;
        Ok(parsed.message.content)
    }
}
