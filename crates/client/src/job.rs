// crates/client/src/job.rs
//! Handles on dispatched jobs: state tracking, cancellation, and the
//! caller-facing progress/result pair.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::codec::Payload;
use crate::error::ClientError;
use crate::types::{JobId, JobResult, JobState, ProgressSnapshot, ProgressUpdate};

/// Handle to a dispatched job, used to inspect and cancel it.
///
/// Clones share state. The handle keeps the session key that was injected
/// into the original submission, so a later re-login does not affect it.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

struct JobInner {
    job_id: JobId,
    endpoint: String,
    auth_key: String,
    api_key: String,
    api: ApiClient,
    state: AtomicU8,
    last_progress: RwLock<ProgressSnapshot>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub(crate) fn new(
        api: ApiClient,
        endpoint: String,
        auth_key: String,
        api_key: String,
        job_id: JobId,
    ) -> Self {
        Self {
            inner: Arc::new(JobInner {
                job_id,
                endpoint,
                auth_key,
                api_key,
                api,
                state: AtomicU8::new(JobState::Queued as u8),
                last_progress: RwLock::new(ProgressSnapshot::initial()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn last_progress(&self) -> ProgressSnapshot {
        match self.inner.last_progress.read() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading last progress: {e}");
                e.into_inner().clone()
            }
        }
    }

    /// True once [`JobHandle::cancel`] has been called on any clone.
    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop the job.
    ///
    /// The handle is marked canceled before the server is contacted: from
    /// the moment this returns, no progress update or result is delivered
    /// for the job, even if a `done` response is already in transit. The
    /// server notification is best-effort; its failure is returned but does
    /// not undo the local cancellation. Canceling a finished job only marks
    /// it locally.
    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.inner.cancel.cancel();
        if !self.transition(JobState::Canceled) {
            debug!(job_id = %self.job_id(), state = %self.state(), "cancel on finished job: local only");
            return Ok(());
        }

        info!(job_id = %self.job_id(), endpoint = %self.endpoint(), "canceling job");
        let body = json!({
            "client_session_auth_key": self.inner.auth_key,
            "job_id": self.inner.job_id,
        });
        let path = format!("{}/cancel", self.inner.endpoint);
        match self.inner.api.post_json(&path, &body).await {
            Ok(response) if response.get("success").and_then(Value::as_bool) == Some(false) => {
                let err = ClientError::from_rejection(response);
                warn!(job_id = %self.job_id(), error = %err, "server refused cancel request");
                Err(err)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(job_id = %self.job_id(), error = %e, "cancel request failed");
                Err(e)
            }
        }
    }

    /// Send additional input to a job that is still running (e.g. the next
    /// chat turn of a streaming session).
    pub async fn append_input(&self, payload: Payload) -> Result<(), ClientError> {
        if self.is_canceled() {
            return Err(ClientError::Canceled {
                job_id: self.inner.job_id.clone(),
            });
        }
        let state = self.state();
        if state.is_terminal() {
            return Err(ClientError::JobNotRunning {
                job_id: self.inner.job_id.clone(),
                state,
            });
        }

        let mut body = payload.into_map();
        body.insert(
            "client_session_auth_key".to_string(),
            Value::String(self.inner.auth_key.clone()),
        );
        body.insert("job_id".to_string(), Value::String(self.inner.job_id.clone()));

        let path = format!("{}/append_input", self.inner.endpoint);
        let response = self.inner.api.post_json(&path, &Value::Object(body)).await?;
        if response.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(ClientError::from_rejection(response));
        }
        debug!(job_id = %self.job_id(), "appended job input");
        Ok(())
    }

    pub(crate) fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub(crate) fn auth_key(&self) -> &str {
        &self.inner.auth_key
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.inner.api_key
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Move to `next` if the job is still in flight. Returns false when the
    /// job already reached a terminal state.
    pub(crate) fn transition(&self, next: JobState) -> bool {
        self.inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                JobState::from_u8(current)
                    .is_in_flight()
                    .then_some(next as u8)
            })
            .is_ok()
    }

    /// Record an in-flight report. Returns false when the job is canceled or
    /// already terminal, in which case the report must be dropped.
    pub(crate) fn record_progress(&self, state: JobState, snapshot: &ProgressSnapshot) -> bool {
        if self.is_canceled() || !self.transition(state) {
            return false;
        }
        match self.inner.last_progress.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(e) => tracing::error!("RwLock poisoned writing last progress: {e}"),
        }
        true
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.inner.job_id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A job accepted by the server and being synchronized in the background.
///
/// Progress arrives through [`RunningJob::next_progress`]; the final outcome
/// through [`RunningJob::wait`]. All progress updates precede the result, and
/// nothing is delivered once the job is canceled.
#[derive(Debug)]
pub struct RunningJob {
    handle: JobHandle,
    progress: mpsc::UnboundedReceiver<ProgressUpdate>,
    result: oneshot::Receiver<Result<JobResult, ClientError>>,
}

impl RunningJob {
    pub(crate) fn new(
        handle: JobHandle,
        progress: mpsc::UnboundedReceiver<ProgressUpdate>,
        result: oneshot::Receiver<Result<JobResult, ClientError>>,
    ) -> Self {
        Self {
            handle,
            progress,
            result,
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn job_id(&self) -> &str {
        self.handle.job_id()
    }

    /// Next progress update, or `None` once the job stopped reporting
    /// progress (finished, failed, or canceled).
    pub async fn next_progress(&mut self) -> Option<ProgressUpdate> {
        let cancel = self.handle.cancellation().clone();
        if cancel.is_cancelled() {
            return None;
        }
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            update = self.progress.recv() => update,
        };
        if cancel.is_cancelled() {
            return None;
        }
        update
    }

    /// Wait for the job's outcome.
    ///
    /// Resolves to `ClientError::Canceled` when the job was canceled locally
    /// or the server reported it canceled.
    pub async fn wait(self) -> Result<JobResult, ClientError> {
        let cancel = self.handle.cancellation().clone();
        let job_id = self.handle.job_id().to_string();
        let canceled = || ClientError::Canceled {
            job_id: job_id.clone(),
        };
        if cancel.is_cancelled() {
            return Err(canceled());
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(canceled()),
            outcome = self.result => outcome,
        };
        if cancel.is_cancelled() {
            return Err(canceled());
        }
        // A dropped sender means the synchronizer stopped without a result.
        outcome.unwrap_or_else(|_| Err(canceled()))
    }

    /// Drive the job to completion, calling `on_progress` for every update
    /// before returning the outcome.
    pub async fn run<F>(mut self, mut on_progress: F) -> Result<JobResult, ClientError>
    where
        F: FnMut(&ProgressUpdate),
    {
        while let Some(update) = self.next_progress().await {
            on_progress(&update);
        }
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn handle(job_id: &str) -> JobHandle {
        let api = ApiClient::new(ClientConfig::default().with_api_server("http://127.0.0.1:9")).unwrap();
        JobHandle::new(api, "ep".into(), "sess".into(), "key".into(), job_id.into())
    }

    #[test]
    fn test_job_handle_lifecycle() {
        let h = handle("J1");
        assert_eq!(h.state(), JobState::Queued);
        assert_eq!(h.last_progress(), ProgressSnapshot::initial());

        let snap = ProgressSnapshot {
            progress: 25.0,
            ..ProgressSnapshot::initial()
        };
        assert!(h.record_progress(JobState::Running, &snap));
        assert_eq!(h.state(), JobState::Running);
        assert_eq!(h.last_progress().progress, 25.0);

        assert!(h.transition(JobState::Done));
        assert_eq!(h.state(), JobState::Done);
        // Terminal states are sticky.
        assert!(!h.transition(JobState::Running));
        assert!(!h.record_progress(JobState::Running, &snap));
        assert_eq!(h.state(), JobState::Done);
    }

    #[test]
    fn test_clones_share_state() {
        let h = handle("J2");
        let other = h.clone();
        other.transition(JobState::Running);
        assert_eq!(h.state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_local_only() {
        // The server address is unreachable: a network call would fail.
        let h = handle("J3");
        h.transition(JobState::Done);
        assert!(h.cancel().await.is_ok());
        assert!(h.is_canceled());
        assert_eq!(h.state(), JobState::Done);
    }

    #[tokio::test]
    async fn test_cancel_marks_locally_even_if_server_unreachable() {
        let h = handle("J4");
        let err = h.cancel().await.unwrap_err();
        assert!(err.is_transient());
        assert!(h.is_canceled());
        assert_eq!(h.state(), JobState::Canceled);
    }

    #[tokio::test]
    async fn test_append_input_rejected_after_finish() {
        let h = handle("J5");
        h.transition(JobState::Error);
        let err = h.append_input(Payload::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::JobNotRunning { state: JobState::Error, .. }));
    }

    #[tokio::test]
    async fn test_running_job_delivers_progress_then_result() {
        let h = handle("J6");
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let job = RunningJob::new(h.clone(), rx, result_rx);

        for pct in [10.0, 20.0] {
            tx.send(ProgressUpdate {
                job_id: "J6".into(),
                state: JobState::Running,
                snapshot: ProgressSnapshot {
                    progress: pct,
                    ..ProgressSnapshot::initial()
                },
            })
            .unwrap();
        }
        drop(tx);
        result_tx
            .send(Ok(JobResult::from_value(serde_json::json!({"text": "ok"}))))
            .unwrap();

        let mut seen = Vec::new();
        let result = job.run(|u| seen.push(u.snapshot.progress)).await.unwrap();
        assert_eq!(seen, vec![10.0, 20.0]);
        assert_eq!(result.text(), Some("ok"));
    }

    #[tokio::test]
    async fn test_running_job_after_cancel_yields_nothing() {
        let h = handle("J7");
        let (tx, rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let mut job = RunningJob::new(h.clone(), rx, result_rx);

        tx.send(ProgressUpdate {
            job_id: "J7".into(),
            state: JobState::Running,
            snapshot: ProgressSnapshot::initial(),
        })
        .unwrap();
        result_tx
            .send(Ok(JobResult::from_value(serde_json::json!({}))))
            .unwrap();

        let _ = h.cancel().await;
        assert!(job.next_progress().await.is_none());
        assert!(matches!(job.wait().await, Err(ClientError::Canceled { .. })));
    }
}
