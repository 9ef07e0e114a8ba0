// crates/client/src/types.rs
//! Job lifecycle types and the parsing of server status reports.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{error_text, ClientError};

/// Server-assigned job identifier.
pub type JobId = String;

/// Lifecycle state of a remote job.
///
/// `Queued` and `Running` are in-flight; everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued = 0,
    Running = 1,
    Done = 2,
    Error = 3,
    Canceled = 4,
}

impl JobState {
    /// Map a `job_state` string from the server. Unknown states count as
    /// running so the synchronizer keeps watching the job.
    pub fn from_wire(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "queued" | "pending" => Self::Queued,
            "done" | "finished" | "completed" => Self::Done,
            "error" | "failed" => Self::Error,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Running,
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Done,
            3 => Self::Error,
            _ => Self::Canceled,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known progress of an in-flight job.
///
/// The server may report partial batches, so `progress` is not guaranteed to
/// increase between snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Percent complete, 0 to 100.
    pub progress: f64,
    /// Position in the worker queue, -1 when unknown or not queued.
    pub queue_position: i64,
    /// Estimated seconds remaining, -1 when unknown.
    pub estimate_secs: f64,
    /// Workers serving the endpoint, -1 when unknown.
    pub workers_online: i64,
    /// Endpoint-specific partial output (e.g. text generated so far).
    pub progress_data: Option<Value>,
}

impl ProgressSnapshot {
    /// The synthetic "request sent" snapshot emitted right after dispatch.
    pub fn initial() -> Self {
        Self {
            progress: 0.0,
            queue_position: -1,
            estimate_secs: -1.0,
            workers_online: -1,
            progress_data: None,
        }
    }

    /// Read the progress fields of a wire object, defaulting what is missing.
    pub(crate) fn from_wire(fields: &Value) -> Self {
        let initial = Self::initial();
        Self {
            progress: number(fields.get("progress")).unwrap_or(initial.progress),
            queue_position: number(fields.get("queue_position"))
                .map(|n| n as i64)
                .unwrap_or(initial.queue_position),
            estimate_secs: number(fields.get("estimate")).unwrap_or(initial.estimate_secs),
            workers_online: number(fields.get("num_workers_online"))
                .map(|n| n as i64)
                .unwrap_or(initial.workers_online),
            progress_data: fields.get("progress_data").filter(|v| !v.is_null()).cloned(),
        }
    }
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::initial()
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One item of a job's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    pub state: JobState,
    pub snapshot: ProgressSnapshot,
}

/// Final outcome of a job as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub success: bool,
    /// The server's result object, verbatim.
    pub payload: Map<String, Value>,
    pub error: Option<String>,
}

impl JobResult {
    /// Build a result from a server object. A missing `success` flag counts
    /// as success; non-object results are wrapped under `result`.
    pub fn from_value(value: Value) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            success,
            payload,
            error,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Convenience accessor for text-producing endpoints.
    pub fn text(&self) -> Option<&str> {
        self.get("text").and_then(Value::as_str)
    }

    /// Successful results pass through; failed ones become `ClientError::Job`
    /// carrying the verbatim payload.
    pub fn into_outcome(self) -> Result<JobResult, ClientError> {
        if self.success {
            return Ok(self);
        }
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "job finished without success".to_string());
        Err(ClientError::Job {
            message,
            response: Value::Object(self.payload),
        })
    }
}

/// Result of a key validation call.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValidation {
    pub ep_version: Option<String>,
    pub response: Value,
}

/// A progress poll response or stream event, classified.
#[derive(Debug)]
pub(crate) enum StatusReport {
    InFlight {
        state: JobState,
        snapshot: ProgressSnapshot,
    },
    Finished(JobResult),
    Canceled,
    Rejected(ClientError),
}

impl StatusReport {
    /// Classify a status object. Progress fields may be nested under a
    /// `progress` object (poll responses) or sit at the top level (stream
    /// events).
    pub(crate) fn parse(response: Value) -> Self {
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return Self::Rejected(ClientError::from_rejection(response));
        }

        let state = match response.get("job_state").and_then(Value::as_str) {
            Some(s) => JobState::from_wire(s),
            None if response.get("job_result").is_some() => JobState::Done,
            None => JobState::Running,
        };

        match state {
            JobState::Queued | JobState::Running => {
                let snapshot = match response.get("progress") {
                    Some(nested @ Value::Object(_)) => ProgressSnapshot::from_wire(nested),
                    _ => ProgressSnapshot::from_wire(&response),
                };
                Self::InFlight { state, snapshot }
            }
            JobState::Canceled => Self::Canceled,
            JobState::Done => {
                let result = response
                    .get("job_result")
                    .cloned()
                    .unwrap_or_else(|| response.clone());
                Self::Finished(JobResult::from_value(result))
            }
            JobState::Error => {
                let mut result = JobResult::from_value(
                    response.get("job_result").cloned().unwrap_or(Value::Null),
                );
                result.success = false;
                if result.error.is_none() {
                    result.error = Some(error_text(&response));
                }
                Self::Finished(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_job_state_discriminants() {
        assert_eq!(JobState::Queued as u8, 0);
        assert_eq!(JobState::Running as u8, 1);
        assert_eq!(JobState::Done as u8, 2);
        assert_eq!(JobState::Error as u8, 3);
        assert_eq!(JobState::Canceled as u8, 4);
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Done,
            JobState::Error,
            JobState::Canceled,
        ] {
            assert_eq!(JobState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_job_state_from_wire() {
        assert_eq!(JobState::from_wire("queued"), JobState::Queued);
        assert_eq!(JobState::from_wire("processing"), JobState::Running);
        assert_eq!(JobState::from_wire("DONE"), JobState::Done);
        assert_eq!(JobState::from_wire("cancelled"), JobState::Canceled);
        assert_eq!(JobState::from_wire("something-new"), JobState::Running);
        assert!(JobState::Queued.is_in_flight());
        assert!(JobState::Canceled.is_terminal());
    }

    #[test]
    fn test_snapshot_defaults_for_missing_fields() {
        let snap = ProgressSnapshot::from_wire(&json!({"progress": 42}));
        assert_eq!(snap.progress, 42.0);
        assert_eq!(snap.queue_position, -1);
        assert_eq!(snap.estimate_secs, -1.0);
        assert_eq!(snap.workers_online, -1);
        assert_eq!(snap.progress_data, None);
    }

    #[test]
    fn test_parse_nested_poll_progress() {
        let report = StatusReport::parse(json!({
            "success": true,
            "job_state": "processing",
            "progress": {
                "progress": 50,
                "queue_position": 0,
                "estimate": 3.5,
                "num_workers_online": 2,
                "progress_data": {"text": "Once upon"},
            },
        }));
        match report {
            StatusReport::InFlight { state, snapshot } => {
                assert_eq!(state, JobState::Running);
                assert_eq!(snapshot.progress, 50.0);
                assert_eq!(snapshot.queue_position, 0);
                assert_eq!(snapshot.estimate_secs, 3.5);
                assert_eq!(snapshot.workers_online, 2);
                assert_eq!(snapshot.progress_data, Some(json!({"text": "Once upon"})));
            }
            other => panic!("expected in-flight, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_flat_stream_event() {
        let report = StatusReport::parse(json!({
            "success": true,
            "job_state": "queued",
            "progress": 0,
            "queue_position": 3,
        }));
        match report {
            StatusReport::InFlight { state, snapshot } => {
                assert_eq!(state, JobState::Queued);
                assert_eq!(snapshot.queue_position, 3);
            }
            other => panic!("expected in-flight, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_done_uses_embedded_result() {
        let report = StatusReport::parse(json!({
            "success": true,
            "job_state": "done",
            "job_result": {"success": true, "text": "hello"},
        }));
        match report {
            StatusReport::Finished(result) => {
                assert!(result.success);
                assert_eq!(result.text(), Some("hello"));
            }
            other => panic!("expected finished, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_state_is_failed_result() {
        let report = StatusReport::parse(json!({
            "success": true,
            "job_state": "error",
            "error": "worker crashed",
        }));
        match report {
            StatusReport::Finished(result) => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("worker crashed"));
                assert!(result.into_outcome().is_err());
            }
            other => panic!("expected finished, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_canceled_and_rejected() {
        assert!(matches!(
            StatusReport::parse(json!({"success": true, "job_state": "canceled"})),
            StatusReport::Canceled
        ));
        assert!(matches!(
            StatusReport::parse(json!({"success": false, "error": "no such job"})),
            StatusReport::Rejected(ClientError::Job { .. })
        ));
    }

    #[test]
    fn test_job_result_from_non_object() {
        let result = JobResult::from_value(json!("plain"));
        assert!(result.success);
        assert_eq!(result.get("result"), Some(&json!("plain")));
    }
}
