// crates/client/src/api.rs
//! Shared HTTP transport for every call the client makes.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{error_text, ClientError, ConfigError};
use crate::session::Session;
use crate::types::KeyValidation;

/// Cheap-to-clone handle on the API server: one connection pool and one
/// config, shared by every session and job task.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiClientInner>,
}

struct ApiClientInner {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(ApiClientInner { http, config }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open a session against `endpoint`. No network call is made until
    /// [`Session::login`].
    pub fn session(
        &self,
        endpoint: impl Into<String>,
        user: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Session {
        Session::new(self.clone(), endpoint.into(), user.into(), api_key.into())
    }

    /// Validate an API key without binding to an endpoint.
    pub async fn validate_key(&self, api_key: &str) -> Result<KeyValidation, ClientError> {
        let response = self
            .get_json(
                "api/validate_key",
                &[
                    ("key", api_key),
                    ("version", self.inner.config.client_version.as_str()),
                ],
            )
            .await?;
        let ep_version = endpoint_version(&response);
        if response.get("success").and_then(Value::as_bool) != Some(true) {
            return Err(ClientError::Authentication {
                message: error_text(&response),
                endpoint_version: ep_version,
            });
        }
        info!("API key validated");
        Ok(KeyValidation {
            ep_version,
            response,
        })
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.inner.config.api_server.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub(crate) async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self
            .inner
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ClientError::transport(&url, e))?;
        decode_response(&url, response).await
    }

    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let url = self.url(path);
        debug!(%url, "POST");
        let response = self
            .inner
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::transport(&url, e))?;
        decode_response(&url, response).await
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("api_server", &self.inner.config.api_server)
            .finish()
    }
}

/// Decode a JSON body. 4xx statuses still count as protocol responses when
/// they carry a `success` flag; 5xx and everything else are transport
/// failures whatever the body says.
async fn decode_response(url: &str, response: reqwest::Response) -> Result<Value, ClientError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ClientError::transport(url, e))?;

    let parsed = serde_json::from_str::<Value>(&body);
    if status.is_success() {
        return parsed.map_err(|e| ClientError::InvalidResponse(format!("{url}: {e}")));
    }
    match parsed {
        Ok(value) if status.is_client_error() && value.get("success").is_some() => Ok(value),
        _ => Err(ClientError::transport(
            url,
            format!("HTTP {status}: {}", truncate(&body, 200)),
        )),
    }
}

pub(crate) fn endpoint_version(response: &Value) -> Option<String> {
    match response.get("ep_version")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
