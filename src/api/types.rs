//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::sandbox::ExecutionResult;

/// `POST /execute` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub language: String,
    /// Missing is the same as empty and is rejected by validation.
    #[serde(default)]
    pub source_code: String,
    /// Wall-clock limit in milliseconds; absent or zero means the default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /execute` success body. `error` is empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub error: String,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            exit_code: result.exit_code,
            error: result.failure.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_optional() {
        let req: ExecuteRequest =
            serde_json::from_str(r#"{"language":"python","source_code":"print(1)"}"#).unwrap();
        assert_eq!(req.timeout_ms, None);

        let req: ExecuteRequest = serde_json::from_str(
            r#"{"language":"go","source_code":"package main","timeout_ms":250}"#,
        )
        .unwrap();
        assert_eq!(req.timeout_ms, Some(250));
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let req: ExecuteRequest = serde_json::from_str(r#"{"language":"python"}"#).unwrap();
        assert_eq!(req.language, "python");
        assert_eq!(req.source_code, "");

        let req: ExecuteRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.language, "");
    }

    #[test]
    fn test_response_from_result() {
        let response = ExecuteResponse::from(ExecutionResult {
            stdout: b"4\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
            failure: None,
        });
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"stdout": "4\n", "stderr": "", "exit_code": 0, "error": ""})
        );
    }
}
