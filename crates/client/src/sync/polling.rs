// crates/client/src/sync/polling.rs
//! Pull strategy: one status request per interval.

use std::time::Duration;

use tracing::{debug, warn};

use super::JobSink;
use crate::types::StatusReport;

/// Poll until the job reaches a terminal state, is canceled, or nobody is
/// waiting for it any more.
///
/// Poll N+1 is only issued after poll N's response has been handled. A failed
/// request is logged and retried on the next tick.
pub(super) async fn run(mut sink: JobSink, interval: Duration) {
    let handle = sink.handle().clone();
    let cancel = handle.cancellation().clone();
    let path = format!("{}/progress", handle.endpoint());
    let mut polls: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            debug!(job_id = %handle.job_id(), polls, "polling stopped: job canceled");
            return;
        }
        if sink.is_abandoned() {
            debug!(job_id = %handle.job_id(), polls, "polling stopped: no receiver");
            return;
        }

        polls += 1;
        let query = [
            ("key", handle.api_key()),
            ("job_id", handle.job_id()),
            ("client_session_auth_key", handle.auth_key()),
        ];
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => continue,
            response = handle.api().get_json(&path, &query) => response,
        };

        match response {
            Ok(body) => {
                debug!(job_id = %handle.job_id(), poll = polls, "progress poll answered");
                match sink.apply(StatusReport::parse(body)) {
                    Some(next) => sink = next,
                    None => return,
                }
            }
            Err(e) => {
                warn!(
                    job_id = %handle.job_id(),
                    poll = polls,
                    error = %e,
                    "progress poll failed, retrying on next tick"
                );
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
