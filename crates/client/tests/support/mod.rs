//! In-process fake API server with scripted replies.
//!
//! Replies are scripted per path (optionally per `job_id`); the last reply
//! of a script repeats forever. Every request is recorded.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    /// Answer after a delay, to keep a request in flight.
    JsonAfter(Duration, Value),
    /// Plain-text error with the given status.
    Status(u16),
    /// A JSON body with the given status.
    JsonStatus(u16, Value),
    /// A `text/event-stream` body carrying one event per value.
    Sse(Vec<Value>),
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Default)]
struct FakeState {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<Recorded>>,
    in_flight: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
}

pub struct FakeServer {
    pub url: String,
    state: Arc<FakeState>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    /// Script replies for `path`. Use `path?job_id=<id>` to script a single job.
    pub fn script(&self, key: &str, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), replies.into_iter().collect());
    }

    pub fn requests(&self, path: &str) -> Vec<Recorded> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests(path).len()
    }

    /// Number of times a request for a job arrived while another request for
    /// the same job was still being answered.
    pub fn overlapping_requests(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }
}

async fn handle(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let job_id = query.get("job_id").cloned();
    state.requests.lock().unwrap().push(Recorded {
        method: method.to_string(),
        path: path.clone(),
        query: query.clone(),
        body: serde_json::from_slice(&body).ok(),
    });

    let reply = {
        let mut scripts = state.scripts.lock().unwrap();
        let key = job_id
            .as_ref()
            .map(|id| format!("{path}?job_id={id}"))
            .filter(|key| scripts.contains_key(key))
            .unwrap_or_else(|| path.clone());
        scripts.get_mut(&key).and_then(next_reply)
    };

    let Some(reply) = reply else {
        return (StatusCode::NOT_FOUND, "not scripted").into_response();
    };

    let tracked = job_id.filter(|_| method == Method::GET);
    if let Some(id) = &tracked {
        let mut in_flight = state.in_flight.lock().unwrap();
        let count = in_flight.entry(id.clone()).or_default();
        *count += 1;
        if *count > 1 {
            state.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    let response = match reply {
        Reply::Json(value) => Json(value).into_response(),
        Reply::JsonAfter(delay, value) => {
            tokio::time::sleep(delay).await;
            Json(value).into_response()
        }
        Reply::Status(code) => (
            StatusCode::from_u16(code).unwrap(),
            "injected failure",
        )
            .into_response(),
        Reply::JsonStatus(code, value) => {
            (StatusCode::from_u16(code).unwrap(), Json(value)).into_response()
        }
        Reply::Sse(events) => {
            let stream = futures_util::stream::iter(
                events
                    .into_iter()
                    .map(|v| Ok::<_, Infallible>(Event::default().data(v.to_string()))),
            );
            Sse::new(stream).into_response()
        }
    };

    if let Some(id) = &tracked {
        if let Some(count) = state.in_flight.lock().unwrap().get_mut(id) {
            *count -= 1;
        }
    }
    response
}

fn next_reply(queue: &mut VecDeque<Reply>) -> Option<Reply> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}
