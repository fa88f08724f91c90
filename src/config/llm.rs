use crate::config::helpers::{optional_env, parse_string_env};
use crate::error::ConfigError;

/// Ollama endpoint used by the evaluator to generate candidate solutions.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub host: String,
    /// Only required by `gexec evaluate`; the server never talks to the LLM.
    pub model: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: None,
        }
    }
}

impl LlmConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("OLLAMA_HOST", defaults.host)?,
            model: optional_env("OLLAMA_MODEL")?,
        })
    }

    /// The configured model, or an error naming the missing variable.
    pub fn require_model(&self) -> Result<&str, ConfigError> {
        self.model
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "OLLAMA_MODEL".to_string(),
                hint: "Set it to the Ollama model used to generate solutions.".to_string(),
            })
    }
}
