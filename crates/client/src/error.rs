// crates/client/src/error.rs
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

use crate::types::JobState;

/// Structured error code a server may send when the session key it was
/// handed is unknown to it.
pub const SESSION_NOT_REGISTERED_CODE: &str = "client_session_not_registered";

/// Errors raised while normalizing a parameter bag.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Parameters must serialize to a JSON object, got {kind}")]
    NotAnObject { kind: &'static str },

    #[error("Parameters could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised while loading client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Invalid API server URL `{url}`: {message}")]
    InvalidServerUrl { url: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Every failure the client can hand back to a caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Authentication rejected: {message}")]
    Authentication {
        message: String,
        endpoint_version: Option<String>,
    },

    #[error("Session key no longer registered: {message}")]
    SessionExpired { message: String },

    #[error("Transport error calling {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Job failed: {message}")]
    Job { message: String, response: Value },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Progress streaming unavailable: {0}")]
    StreamingUnavailable(String),

    #[error("Not logged in to endpoint `{endpoint}`")]
    NotLoggedIn { endpoint: String },

    #[error("Job {job_id} was canceled")]
    Canceled { job_id: String },

    #[error("Job {job_id} is no longer running (state: {state})")]
    JobNotRunning { job_id: String, state: JobState },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// True when the caller should log in again and retry the request.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }

    /// True for network-level failures that say nothing about the job itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub(crate) fn transport(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Classify a `success=false` response from a job-related call.
    ///
    /// Session expiry is recognized by structured `error_code` first, then by
    /// the server's error text.
    pub(crate) fn from_rejection(response: Value) -> Self {
        let message = error_text(&response);
        let coded = response
            .get("error_code")
            .and_then(Value::as_str)
            .is_some_and(|code| code == SESSION_NOT_REGISTERED_CODE);
        if coded || mentions_unregistered_session(&message) {
            Self::SessionExpired { message }
        } else {
            Self::Job { message, response }
        }
    }
}

/// Server error text of a response, or a placeholder when none was sent.
pub(crate) fn error_text(response: &Value) -> String {
    match response.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown error".to_string(),
        Some(other) => other.to_string(),
    }
}

fn mentions_unregistered_session(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("not registered") && lower.contains("session")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejection_with_error_code_is_session_expired() {
        let err = ClientError::from_rejection(json!({
            "success": false,
            "error": "whatever",
            "error_code": "client_session_not_registered",
        }));
        assert!(err.is_session_expired());
    }

    #[test]
    fn test_rejection_with_legacy_text_is_session_expired() {
        let err = ClientError::from_rejection(json!({
            "success": false,
            "error": "Client session authentication key not registered in API Server",
        }));
        assert!(matches!(err, ClientError::SessionExpired { .. }));
    }

    #[test]
    fn test_other_rejection_is_job_error_with_raw_response() {
        let raw = json!({"success": false, "error": "prompt too long", "limit": 4096});
        let err = ClientError::from_rejection(raw.clone());
        match err {
            ClientError::Job { message, response } => {
                assert_eq!(message, "prompt too long");
                assert_eq!(response, raw);
            }
            other => panic!("expected Job error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_text_fallbacks() {
        assert_eq!(error_text(&json!({})), "unknown error");
        assert_eq!(error_text(&json!({"error": null})), "unknown error");
        assert_eq!(error_text(&json!({"error": {"code": 3}})), r#"{"code":3}"#);
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Canceled {
            job_id: "J1".to_string(),
        };
        assert_eq!(err.to_string(), "Job J1 was canceled");

        let err = ClientError::transport("http://localhost/x", "connection refused");
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Transport error calling http://localhost/x: connection refused"
        );
    }
}
