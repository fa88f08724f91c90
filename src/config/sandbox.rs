use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env, parse_pairs};
use crate::error::ConfigError;

/// Default language → image mapping.
const DEFAULT_LANGUAGES: &[(&str, &str)] = &[
    ("python", "python:3.9-slim"),
    ("py", "python:3.9-slim"),
    ("golang", "golang:1.24-alpine"),
    ("go", "golang:1.24-alpine"),
];

/// Container sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Timeout applied when a request leaves `timeout_ms` unset or zero.
    pub default_timeout: Duration,
    /// Upper bound on any requested timeout.
    pub max_timeout: Duration,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CFS quota in microseconds per 100ms period (50000 = half a CPU).
    pub cpu_quota: i64,
    /// Maximum number of processes inside one container.
    pub pids_limit: i64,
    /// Per-call timeout for kill/remove during teardown.
    pub teardown_timeout: Duration,
    /// Lowercased language name → Docker image.
    pub languages: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(60_000),
            max_timeout: Duration::from_millis(300_000),
            memory_limit_mb: 256,
            cpu_quota: 50_000,
            pids_limit: 64,
            teardown_timeout: Duration::from_millis(5_000),
            languages: DEFAULT_LANGUAGES
                .iter()
                .map(|(lang, image)| (lang.to_string(), image.to_string()))
                .collect(),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let languages = match optional_env("SANDBOX_LANGUAGES")? {
            Some(raw) => parse_pairs("SANDBOX_LANGUAGES", &raw)?
                .into_iter()
                .map(|(lang, image)| (lang.to_lowercase(), image))
                .collect(),
            None => defaults.languages,
        };

        let config = Self {
            default_timeout: Duration::from_millis(parse_optional_env(
                "SANDBOX_DEFAULT_TIMEOUT_MS",
                60_000u64,
            )?),
            max_timeout: Duration::from_millis(parse_optional_env(
                "SANDBOX_MAX_TIMEOUT_MS",
                300_000u64,
            )?),
            memory_limit_mb: parse_optional_env("SANDBOX_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            cpu_quota: parse_optional_env("SANDBOX_CPU_QUOTA", defaults.cpu_quota)?,
            pids_limit: parse_optional_env("SANDBOX_PIDS_LIMIT", defaults.pids_limit)?,
            teardown_timeout: Duration::from_millis(parse_optional_env(
                "SANDBOX_TEARDOWN_TIMEOUT_MS",
                5_000u64,
            )?),
            languages,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_DEFAULT_TIMEOUT_MS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_timeout < self.default_timeout {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_MAX_TIMEOUT_MS".to_string(),
                message: format!(
                    "{}ms is below the default timeout of {}ms",
                    self.max_timeout.as_millis(),
                    self.default_timeout.as_millis()
                ),
            });
        }
        if self.memory_limit_mb == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_MEMORY_LIMIT_MB".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.cpu_quota <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_CPU_QUOTA".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.languages.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_LANGUAGES".to_string(),
                message: "at least one language is required".to_string(),
            });
        }
        Ok(())
    }

    /// Look up the image for a language (case-insensitive).
    pub fn image_for(&self, language: &str) -> Option<&str> {
        self.languages
            .get(&language.to_lowercase())
            .map(String::as_str)
    }

    /// Resolve a request's timeout: unset or zero means the default, and
    /// anything above the configured ceiling is clamped.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            None | Some(0) => self.default_timeout,
            Some(ms) => Duration::from_millis(ms).min(self.max_timeout),
        }
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64).saturating_mul(1024 * 1024)
    }
}
