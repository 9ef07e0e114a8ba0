// crates/client/src/sync/streaming.rs
//! Push strategy: a server-sent event subscription per job.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::JobSink;
use crate::error::ClientError;
use crate::job::JobHandle;
use crate::types::StatusReport;

enum OpenError {
    /// The server has no event stream for us; a configuration problem.
    Unavailable(String),
    Transport(ClientError),
}

/// Subscribe and apply events until the job finishes or is canceled. A
/// dropped connection is re-opened after `reconnect_delay`.
pub(super) async fn run(mut sink: JobSink, reconnect_delay: Duration) {
    let handle = sink.handle().clone();
    let cancel = handle.cancellation().clone();

    loop {
        if cancel.is_cancelled() || sink.is_abandoned() {
            debug!(job_id = %handle.job_id(), "event stream stopped");
            return;
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => continue,
            opened = open(&handle) => opened,
        };
        match opened {
            Ok(response) => match consume(sink, response, &cancel).await {
                Some(interrupted) => sink = interrupted,
                None => return,
            },
            Err(OpenError::Unavailable(reason)) => {
                sink.finish(Err(ClientError::StreamingUnavailable(reason)));
                return;
            }
            Err(OpenError::Transport(e)) => {
                warn!(job_id = %handle.job_id(), error = %e, "event stream connect failed, retrying");
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

async fn open(handle: &JobHandle) -> Result<reqwest::Response, OpenError> {
    let url = handle.api().url("stream_progress");
    let response = handle
        .api()
        .http()
        .get(&url)
        .query(&[
            ("client_session_auth_key", handle.auth_key()),
            ("job_id", handle.job_id()),
        ])
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| OpenError::Transport(ClientError::transport(&url, e)))?;

    let status = response.status();
    if matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) {
        return Err(OpenError::Unavailable(format!("{url} answered {status}")));
    }
    if !status.is_success() {
        return Err(OpenError::Transport(ClientError::transport(
            &url,
            format!("HTTP {status}"),
        )));
    }
    let is_event_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));
    if !is_event_stream {
        return Err(OpenError::Unavailable(format!(
            "{url} did not answer with an event stream"
        )));
    }
    Ok(response)
}

/// Apply events from one connection. Returns the sink when the connection
/// ended before the job did.
async fn consume(
    mut sink: JobSink,
    response: reqwest::Response,
    cancel: &CancellationToken,
) -> Option<JobSink> {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let events = match decoder.push(&bytes) {
                    Ok(events) => events,
                    Err(EventTooLarge { pending }) => {
                        warn!(job_id = %sink.handle().job_id(), pending, "unterminated stream event too large, reconnecting");
                        return Some(sink);
                    }
                };
                for data in events {
                    let event = match serde_json::from_str::<Value>(&data) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(job_id = %sink.handle().job_id(), error = %e, "skipping undecodable stream event");
                            continue;
                        }
                    };
                    sink = sink.apply(StatusReport::parse(event))?;
                }
            }
            Some(Err(e)) => {
                warn!(job_id = %sink.handle().job_id(), error = %e, "event stream interrupted");
                return Some(sink);
            }
            None => {
                debug!(job_id = %sink.handle().job_id(), "event stream closed before job finished");
                return Some(sink);
            }
        }
    }
}

/// Largest pending event the decoder buffers before giving up on the
/// connection.
const MAX_PENDING_EVENT_BYTES: usize = 1024 * 1024;

/// A stream sent more than [`MAX_PENDING_EVENT_BYTES`] without ending an
/// event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct EventTooLarge {
    pub pending: usize,
}

/// Incremental decoder for `text/event-stream` bodies. Yields the `data`
/// payload of each complete event. Lines may end in `\n` or `\r\n`.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, EventTooLarge> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, consumed)) = find_event_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..consumed).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            let data: Vec<&str> = text
                .split('\n')
                .map(|line| line.strip_suffix('\r').unwrap_or(line))
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }

        if self.buffer.len() > MAX_PENDING_EVENT_BYTES {
            let pending = self.buffer.len();
            self.buffer.clear();
            return Err(EventTooLarge { pending });
        }
        Ok(events)
    }
}

/// Locate the blank line ending the first event: `(event length, bytes to
/// consume)`.
fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    buffer
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'\n')
        .find_map(|(i, _)| match &buffer[i + 1..] {
            [b'\n', ..] => Some((i, i + 2)),
            [b'\r', b'\n', ..] => Some((i, i + 3)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_events() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\n").unwrap();
        assert_eq!(events, vec![r#"{"a":1}"#, r#"{"a":2}"#]);
    }

    #[test]
    fn test_decoder_handles_chunk_boundaries_and_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"job_st").unwrap().is_empty());
        assert!(decoder.push(b"ate\":\"done\"}\r\n").unwrap().is_empty());
        assert!(decoder.push(b"\r").unwrap().is_empty());
        let events = decoder.push(b"\n").unwrap();
        assert_eq!(events, vec![r#"{"job_state":"done"}"#]);
    }

    #[test]
    fn test_decoder_keeps_bare_carriage_returns_in_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: a\rb\r\n\r\n").unwrap();
        assert_eq!(events, vec!["a\rb"]);
    }

    #[test]
    fn test_decoder_skips_comments_and_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder
            .push(b": keep-alive\n\nevent: progress\ndata: line1\ndata: line2\n\n")
            .unwrap();
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[test]
    fn test_decoder_rejects_unterminated_event_past_limit() {
        let mut decoder = SseDecoder::default();
        let chunk = vec![b'x'; 64 * 1024];
        let mut result = Ok(Vec::new());
        for _ in 0..=(MAX_PENDING_EVENT_BYTES / chunk.len()) {
            result = decoder.push(&chunk);
            if result.is_err() {
                break;
            }
        }
        let err = result.unwrap_err();
        assert!(err.pending > MAX_PENDING_EVENT_BYTES);

        // The decoder starts clean afterwards.
        assert_eq!(decoder.push(b"data: ok\n\n").unwrap(), vec!["ok"]);
    }
}
