use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating unset and empty as `None`.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?.unwrap_or_else(|| default.into()))
}

/// Parse a comma-separated `key=value` list (e.g. `python=python:3.9-slim,go=golang:1.24`).
///
/// Only the first `=` splits, so values may themselves contain `=`.
pub(crate) fn parse_pairs(key: &str, raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (k, v) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected name=value, got {entry:?}"),
                })?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("empty name or value in {entry:?}"),
                });
            }
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("X", "python=python:3.9-slim, go = golang:1.24-alpine,").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("python".to_string(), "python:3.9-slim".to_string()),
                ("go".to_string(), "golang:1.24-alpine".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_pairs_rejects_missing_separator() {
        let err = parse_pairs("SANDBOX_LANGUAGES", "python").unwrap_err();
        assert!(err.to_string().contains("SANDBOX_LANGUAGES"));
    }

    #[test]
    fn test_parse_optional_env_default_when_unset() {
        let v: u64 = parse_optional_env("GEXEC_TEST_DEFINITELY_UNSET_VAR", 42).unwrap();
        assert_eq!(v, 42);
    }
}
