// crates/client/src/dispatch.rs
//! Job submission and interpretation of the immediate accept/reject answer.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::codec::Payload;
use crate::error::ClientError;
use crate::job::{JobHandle, RunningJob};
use crate::sync::{self, JobSink, SyncStrategy};
use crate::types::{JobResult, JobState, ProgressSnapshot, ProgressUpdate};

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Whether the caller wants progress updates. Without them the server is
    /// asked to answer with the final result directly (`wait_for_result`).
    pub progress: bool,
    /// Overrides the session's default strategy.
    pub strategy: Option<SyncStrategy>,
    /// Overrides the session's poll interval / stream reconnect delay.
    pub progress_interval: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_progress() -> Self {
        Self {
            progress: true,
            ..Self::default()
        }
    }

    pub fn without_progress() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }
}

/// What the server did with a submission.
#[derive(Debug)]
pub enum Submission {
    /// The server computed the result synchronously; no job was created.
    Completed(JobResult),
    /// The server queued a job that is now being synchronized.
    Running(RunningJob),
}

impl Submission {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Completed(_) => None,
            Self::Running(job) => Some(job.job_id()),
        }
    }

    /// Wait for the final result, discarding progress.
    pub async fn wait(self) -> Result<JobResult, ClientError> {
        match self {
            Self::Completed(result) => Ok(result),
            Self::Running(job) => job.wait().await,
        }
    }
}

/// Everything the dispatcher needs from the session, captured at submit time.
pub(crate) struct DispatchContext<'a> {
    pub api: &'a ApiClient,
    pub endpoint: &'a str,
    pub auth_key: String,
    pub api_key: String,
    pub strategy: SyncStrategy,
    pub interval: Duration,
}

/// Build the outgoing body: the normalized parameters plus the injected
/// credentials and `wait_for_result` flag.
pub(crate) fn request_body(
    payload: Payload,
    auth_key: &str,
    api_key: &str,
    wait_for_result: bool,
) -> Map<String, Value> {
    let mut body = payload.into_map();
    body.insert(
        "client_session_auth_key".to_string(),
        Value::String(auth_key.to_string()),
    );
    body.insert("key".to_string(), Value::String(api_key.to_string()));
    body.insert("wait_for_result".to_string(), Value::Bool(wait_for_result));
    body
}

/// Submit a job. Never retries: a `SessionExpired` error is for the caller
/// to handle by logging in again.
pub(crate) async fn submit(
    ctx: DispatchContext<'_>,
    payload: Payload,
    progress: bool,
) -> Result<Submission, ClientError> {
    let wait_for_result = !progress;
    let body = request_body(payload, &ctx.auth_key, &ctx.api_key, wait_for_result);
    info!(endpoint = %ctx.endpoint, wait_for_result, "submitting job");

    let response = ctx.api.post_json(ctx.endpoint, &Value::Object(body)).await?;

    if response.get("success").and_then(Value::as_bool) != Some(true) {
        let err = ClientError::from_rejection(response);
        warn!(endpoint = %ctx.endpoint, error = %err, "job request rejected");
        return Err(err);
    }

    let job_id = match response.get("job_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            debug!(endpoint = %ctx.endpoint, "job answered synchronously");
            return Ok(Submission::Completed(JobResult::from_value(response)));
        }
    };

    info!(endpoint = %ctx.endpoint, %job_id, strategy = ?ctx.strategy, "job accepted");
    let handle = JobHandle::new(
        ctx.api.clone(),
        ctx.endpoint.to_string(),
        ctx.auth_key,
        ctx.api_key,
        job_id.clone(),
    );
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = oneshot::channel();

    let progress_tx = if progress {
        // "Request sent" marker, queued before any synchronization starts.
        let _ = progress_tx.send(ProgressUpdate {
            job_id,
            state: JobState::Queued,
            snapshot: ProgressSnapshot::initial(),
        });
        Some(progress_tx)
    } else {
        None
    };

    let sink = JobSink::new(handle.clone(), progress_tx, result_tx);
    sync::spawn(ctx.strategy, sink, ctx.interval);

    Ok(Submission::Running(RunningJob::new(handle, progress_rx, result_rx)))
}
