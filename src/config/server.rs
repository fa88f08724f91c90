use std::net::SocketAddr;
use std::time::Duration;

use crate::config::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl HttpConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("HTTP_HOST", defaults.host)?,
            port: parse_optional_env("HTTP_PORT", defaults.port)?,
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "HTTP_HOST".to_string(),
                message: format!("{}:{} is not a socket address: {}", self.host, self.port, e),
            })
    }
}

/// Per-caller admission control for `/execute`.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Bucket capacity (and the allowance of a fresh caller).
    pub burst: u32,
    /// Buckets untouched for this long are evicted.
    pub idle_ttl: Duration,
    /// Upper bound on tracked caller keys.
    pub max_keys: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // one request every six seconds
            refill_per_sec: 1.0 / 6.0,
            burst: 10,
            idle_ttl: Duration::from_secs(600),
            max_keys: 10_000,
        }
    }
}

impl RateLimitConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            refill_per_sec: parse_optional_env("RATE_LIMIT_REFILL_PER_SEC", defaults.refill_per_sec)?,
            burst: parse_optional_env("RATE_LIMIT_BURST", defaults.burst)?,
            idle_ttl: Duration::from_secs(parse_optional_env(
                "RATE_LIMIT_IDLE_SECS",
                defaults.idle_ttl.as_secs(),
            )?),
            max_keys: parse_optional_env("RATE_LIMIT_MAX_KEYS", defaults.max_keys)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.refill_per_sec.is_finite() || self.refill_per_sec < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_REFILL_PER_SEC".to_string(),
                message: "must be a non-negative number".to_string(),
            });
        }
        if self.burst == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_BURST".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_keys == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_MAX_KEYS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.idle_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_IDLE_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long in-flight requests get to finish before the registry sweep.
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
        }
    }
}

impl ShutdownConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            grace_period: Duration::from_secs(parse_optional_env("SHUTDOWN_GRACE_SECS", 30u64)?),
        })
    }
}
