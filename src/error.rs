//! Error types for the sandbox service.

use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors raised by a [`ContainerRuntime`](crate::sandbox::ContainerRuntime) call.
///
/// These carry the runtime's own description; the executor wraps them in
/// an [`ExecutionError`] that names the pipeline step that failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Api(String),

    /// The instance is already gone. Teardown treats this as success.
    #[error("no such container: {0}")]
    NotFound(String),
}

/// Coarse classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Rejected before any runtime call was made.
    Validation,
    /// The container runtime failed somewhere in the pipeline.
    Runtime,
    /// The program outlived its deadline.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Runtime => write!(f, "runtime"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// A failed execution request.
///
/// The `Display` output is what callers see in the `error` field of the
/// response, so keep the messages short and free of internal detail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("source_code cannot be empty")]
    EmptySource,

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to pull image {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("failed to create container: {0}")]
    InstanceCreateFailed(String),

    #[error("failed to copy source into container: {0}")]
    PayloadFailed(String),

    #[error("failed to attach to container: {0}")]
    AttachFailed(String),

    #[error("failed to start container: {0}")]
    StartFailed(String),

    #[error("error waiting for container: {0}")]
    WaitFailed(String),

    #[error("execution timed out after {}ms", .0.as_millis())]
    ExecutionTimeout(Duration),

    #[error("failed to read container output: {0}")]
    OutputReadFailed(String),

    #[error("failed to inspect container: {0}")]
    InspectFailed(String),
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::EmptySource | Self::UnsupportedLanguage(_) => FailureKind::Validation,
            Self::ExecutionTimeout(_) => FailureKind::Timeout,
            _ => FailureKind::Runtime,
        }
    }

    /// Wrap a runtime error for a given pipeline step, keeping
    /// connection failures distinguishable from API failures.
    pub(crate) fn from_runtime(err: RuntimeError, wrap: fn(String) -> Self) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => Self::RuntimeUnavailable(reason),
            other => wrap(other.to_string()),
        }
    }
}

/// LLM client errors (evaluator only).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("{provider} did not become available within {timeout:?}")]
    Unavailable { provider: String, timeout: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        assert_eq!(
            ExecutionError::EmptySource.to_string(),
            "source_code cannot be empty"
        );
        assert_eq!(
            ExecutionError::UnsupportedLanguage("ruby".to_string()).to_string(),
            "unsupported language: ruby"
        );
    }

    #[test]
    fn test_timeout_message_and_kind() {
        let err = ExecutionError::ExecutionTimeout(Duration::from_millis(100));
        assert_eq!(err.to_string(), "execution timed out after 100ms");
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[test]
    fn test_from_runtime_keeps_unavailable() {
        let err = ExecutionError::from_runtime(
            RuntimeError::Unavailable("socket missing".to_string()),
            ExecutionError::StartFailed,
        );
        assert!(matches!(err, ExecutionError::RuntimeUnavailable(_)));

        let err = ExecutionError::from_runtime(
            RuntimeError::Api("boom".to_string()),
            ExecutionError::StartFailed,
        );
        assert_eq!(err.to_string(), "failed to start container: boom");
        assert_eq!(err.kind(), FailureKind::Runtime);
    }
}
