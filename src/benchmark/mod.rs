//! pass@k evaluation of generated solutions.
//!
//! For each problem the generator gets up to `k` attempts. An attempt
//! passes when its extracted program prints the expected output (compared
//! after trimming) for every test case. A problem counts toward pass@1
//! only if the first attempt passed.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::CodeGenerator;
use crate::sandbox::SandboxExecutor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub description: String,
    pub language: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// `input` is carried for completeness; programs run without stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total_problems: usize,
    pub passed_problems: usize,
    pub pass_1_rate: f64,
    pub pass_k_rate: f64,
}

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:python|py|golang|go)?[ \t]*\n?(.*?)```")
        .expect("fenced block pattern is valid")
});

/// Pull the first fenced code block out of a model reply, or fall back to
/// the whole reply. The result is trimmed.
pub fn extract_code(text: &str) -> String {
    FENCED_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim()
        .to_string()
}

/// Load a JSON array of problems.
pub fn load_problems(path: &Path) -> anyhow::Result<Vec<Problem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read problems file {}", path.display()))?;
    let problems: Vec<Problem> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse problems file {}", path.display()))?;
    Ok(problems)
}

/// Run every problem through up to `k` generate-and-execute attempts.
pub async fn run_evaluation(
    problems: &[Problem],
    k: u32,
    generator: &dyn CodeGenerator,
    executor: &SandboxExecutor,
) -> Report {
    let k = k.max(1);
    let mut passed = 0usize;
    let mut pass_1 = 0usize;

    for problem in problems {
        match first_passing_attempt(problem, k, generator, executor).await {
            Some(attempt) => {
                tracing::info!(problem = %problem.id, attempt, "Problem solved");
                passed += 1;
                if attempt == 1 {
                    pass_1 += 1;
                }
            }
            None => tracing::info!(problem = %problem.id, attempts = k, "Problem not solved"),
        }
    }

    let total = problems.len();
    let rate = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

    Report {
        total_problems: total,
        passed_problems: passed,
        pass_1_rate: rate(pass_1),
        pass_k_rate: rate(passed),
    }
}

async fn first_passing_attempt(
    problem: &Problem,
    k: u32,
    generator: &dyn CodeGenerator,
    executor: &SandboxExecutor,
) -> Option<u32> {
    for attempt in 1..=k {
        let reply = match generator
            .generate_code(&problem.description, &problem.language)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(problem = %problem.id, attempt, error = %e, "Generation failed");
                continue;
            }
        };

        let code = extract_code(&reply);
        if passes_all(problem, &code, executor).await {
            return Some(attempt);
        }
        tracing::debug!(problem = %problem.id, attempt, "Attempt failed");
    }
    None
}

async fn passes_all(problem: &Problem, code: &str, executor: &SandboxExecutor) -> bool {
    for case in &problem.test_cases {
        let request = match executor.request(&problem.language, code, None) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(problem = %problem.id, error = %e, "Rejected candidate");
                return false;
            }
        };
        let output = match executor.execute(&request).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(problem = %problem.id, error = %e, "Candidate execution failed");
                return false;
            }
        };
        if String::from_utf8_lossy(&output.stdout).trim() != case.expected_output.trim() {
            return false;
        }
    }
    true
}
