//! Configuration for the sandbox service.
//!
//! Every setting comes from an env var with a typed default. A `.env` file
//! in the working directory is loaded first via dotenvy, which never
//! overwrites variables that are already set.

pub(crate) mod helpers;
mod llm;
mod sandbox;
mod server;

use crate::error::ConfigError;

pub use self::llm::LlmConfig;
pub use self::sandbox::SandboxConfig;
pub use self::server::{HttpConfig, RateLimitConfig, ShutdownConfig};

/// Main configuration for the service.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub http: HttpConfig,
    pub sandbox: SandboxConfig,
    pub rate_limit: RateLimitConfig,
    pub shutdown: ShutdownConfig,
    pub llm: LlmConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http: HttpConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            rate_limit: RateLimitConfig::resolve()?,
            shutdown: ShutdownConfig::resolve()?,
            llm: LlmConfig::resolve()?,
        })
    }
}
