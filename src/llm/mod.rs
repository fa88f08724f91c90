//! LLM integration for the evaluator.
//!
//! The server never talks to a model; only `gexec evaluate` generates
//! candidate solutions, through the [`CodeGenerator`] seam.

mod ollama;

pub use ollama::OllamaClient;

use async_trait::async_trait;

use crate::error::LlmError;

/// Instruction sent ahead of every problem statement.
pub const SYSTEM_PROMPT: &str = "You are an expert programmer. Provide only the function/class implementation. Do not include usage examples.";

/// Produces a candidate program for a problem statement.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Return the raw model reply; code extraction is the caller's job.
    async fn generate_code(&self, problem: &str, language: &str) -> Result<String, LlmError>;
}

/// The user turn for a problem.
pub fn user_prompt(problem: &str, language: &str) -> String {
    format!("Write a {} solution for:\n{}", language, problem)
}
