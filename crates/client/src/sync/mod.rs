// crates/client/src/sync/mod.rs
//! Progress synchronization: drives a dispatched job to its terminal state.
//!
//! Two interchangeable strategies, picked per job at dispatch time:
//! - `Polling`: one status request per interval, never overlapping
//! - `Streaming`: a server-sent event subscription
//!
//! Both feed a [`JobSink`], which owns the delivery rules (ordering, exactly
//! one result, silence after cancellation).

mod polling;
mod streaming;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::job::JobHandle;
use crate::types::{JobResult, JobState, ProgressSnapshot, ProgressUpdate, StatusReport};

/// How a job's progress is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    #[default]
    Polling,
    /// Explicit opt-in. Fails with `StreamingUnavailable` when the server has
    /// no event stream, rather than falling back to polling.
    Streaming,
}

impl std::str::FromStr for SyncStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poll" | "polling" => Ok(Self::Polling),
            "stream" | "streaming" => Ok(Self::Streaming),
            other => Err(format!("unknown sync strategy `{other}`")),
        }
    }
}

/// Start synchronizing a job in the background.
pub(crate) fn spawn(strategy: SyncStrategy, sink: JobSink, interval: Duration) -> JoinHandle<()> {
    debug!(job_id = %sink.handle().job_id(), ?strategy, "starting progress synchronizer");
    match strategy {
        SyncStrategy::Polling => tokio::spawn(polling::run(sink, interval)),
        SyncStrategy::Streaming => tokio::spawn(streaming::run(sink, interval)),
    }
}

/// Delivery side of a running job.
pub(crate) struct JobSink {
    handle: JobHandle,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    result: oneshot::Sender<Result<JobResult, ClientError>>,
}

impl JobSink {
    pub(crate) fn new(
        handle: JobHandle,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
        result: oneshot::Sender<Result<JobResult, ClientError>>,
    ) -> Self {
        Self {
            handle,
            progress,
            result,
        }
    }

    pub(crate) fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// The caller dropped its `RunningJob`; nobody is waiting any more.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.result.is_closed()
    }

    /// Forward an in-flight snapshot. Returns false when the job is canceled
    /// or already finished.
    pub(crate) fn progress(&self, state: JobState, snapshot: ProgressSnapshot) -> bool {
        if !self.handle.record_progress(state, &snapshot) {
            return false;
        }
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressUpdate {
                job_id: self.handle.job_id().to_string(),
                state,
                snapshot,
            });
        }
        true
    }

    /// Deliver the outcome exactly once. The progress channel is closed
    /// first so no update can follow the result.
    pub(crate) fn finish(self, outcome: Result<JobResult, ClientError>) {
        let JobSink {
            handle,
            progress,
            result,
        } = self;
        drop(progress);

        if handle.is_canceled() {
            debug!(job_id = %handle.job_id(), "dropping outcome of canceled job");
            return;
        }
        let terminal = if outcome.is_ok() {
            JobState::Done
        } else {
            JobState::Error
        };
        if !handle.transition(terminal) {
            return;
        }
        match &outcome {
            Ok(_) => info!(job_id = %handle.job_id(), "job done"),
            Err(e) => warn!(job_id = %handle.job_id(), error = %e, "job failed"),
        }
        let _ = result.send(outcome);
    }

    /// Apply one classified status report. Returns the sink back while the
    /// job is still in flight.
    pub(crate) fn apply(self, report: StatusReport) -> Option<Self> {
        match report {
            StatusReport::InFlight { state, snapshot } => {
                self.progress(state, snapshot).then_some(self)
            }
            StatusReport::Finished(result) => {
                self.finish(result.into_outcome());
                None
            }
            StatusReport::Canceled => {
                info!(job_id = %self.handle.job_id(), "server reported job canceled");
                self.handle.transition(JobState::Canceled);
                None
            }
            StatusReport::Rejected(err) => {
                self.finish(Err(err));
                None
            }
        }
    }
}
