// crates/client/src/session.rs
//! Session management: credentials, login, and the job entry points.

use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::api::{endpoint_version, ApiClient};
use crate::codec::Payload;
use crate::dispatch::{self, DispatchContext, SubmitOptions, Submission};
use crate::error::{error_text, ClientError};
use crate::sync::SyncStrategy;
use crate::types::{JobResult, KeyValidation, ProgressUpdate};

#[derive(Clone)]
struct Credentials {
    user: String,
    api_key: String,
    /// Server-issued session key; `None` until a login succeeds.
    auth_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("api_key", &"<redacted>")
            .field("logged_in", &self.auth_key.is_some())
            .finish()
    }
}

/// A caller-owned session against one endpoint.
///
/// Safe to share between concurrently running jobs: they only read the
/// credentials, and a re-login replaces the session key for future
/// submissions only (last writer wins).
#[derive(Debug)]
pub struct Session {
    api: ApiClient,
    endpoint: String,
    credentials: RwLock<Credentials>,
    progress_interval: Duration,
    strategy: SyncStrategy,
}

impl Session {
    pub(crate) fn new(api: ApiClient, endpoint: String, user: String, api_key: String) -> Self {
        let progress_interval = api.config().progress_interval;
        Self {
            api,
            endpoint,
            credentials: RwLock::new(Credentials {
                user,
                api_key,
                auth_key: None,
            }),
            progress_interval,
            strategy: SyncStrategy::default(),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn user(&self) -> String {
        self.read_credentials().user.clone()
    }

    /// Current session key, if logged in.
    pub fn auth_key(&self) -> Option<String> {
        self.read_credentials().auth_key.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.read_credentials().auth_key.is_some()
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Exchange the API key for a session key.
    ///
    /// `user` / `api_key` override the stored credentials for this and later
    /// logins. On rejection nothing is stored.
    pub async fn login(
        &self,
        user: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<String, ClientError> {
        let (user, api_key) = {
            let creds = self.read_credentials();
            (
                user.map_or_else(|| creds.user.clone(), str::to_string),
                api_key.map_or_else(|| creds.api_key.clone(), str::to_string),
            )
        };

        let path = format!("{}/login", self.endpoint);
        let response = self
            .api
            .get_json(
                &path,
                &[
                    ("user", user.as_str()),
                    ("key", api_key.as_str()),
                    ("version", self.api.config().client_version.as_str()),
                ],
            )
            .await?;

        let ep_version = endpoint_version(&response);
        if response.get("success").and_then(Value::as_bool) != Some(true) {
            let message = error_text(&response);
            warn!(endpoint = %self.endpoint, %user, ep_version = ?ep_version, %message, "login rejected");
            return Err(ClientError::Authentication {
                message,
                endpoint_version: ep_version,
            });
        }

        let auth_key = match response.get("client_session_auth_key") {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            _ => {
                return Err(ClientError::InvalidResponse(
                    "login succeeded without client_session_auth_key".to_string(),
                ))
            }
        };

        match self.credentials.write() {
            Ok(mut creds) => {
                *creds = Credentials {
                    user: user.clone(),
                    api_key,
                    auth_key: Some(auth_key.clone()),
                };
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing session credentials: {e}");
                *e.into_inner() = Credentials {
                    user: user.clone(),
                    api_key,
                    auth_key: Some(auth_key.clone()),
                };
            }
        }
        info!(endpoint = %self.endpoint, %user, ep_version = ?ep_version, "logged in");
        Ok(auth_key)
    }

    /// Validate a key (the stored one when `None`) without logging in.
    pub async fn validate_key(&self, api_key: Option<&str>) -> Result<KeyValidation, ClientError> {
        let api_key = api_key.map_or_else(|| self.read_credentials().api_key.clone(), str::to_string);
        self.api.validate_key(&api_key).await
    }

    /// Submit a job. The payload is sent with the current session key; the
    /// job keeps that key even if the session logs in again later.
    pub async fn submit(
        &self,
        payload: Payload,
        options: SubmitOptions,
    ) -> Result<Submission, ClientError> {
        let (auth_key, api_key) = {
            let creds = self.read_credentials();
            let auth_key = creds.auth_key.clone().ok_or_else(|| ClientError::NotLoggedIn {
                endpoint: self.endpoint.clone(),
            })?;
            (auth_key, creds.api_key.clone())
        };

        let ctx = DispatchContext {
            api: &self.api,
            endpoint: &self.endpoint,
            auth_key,
            api_key,
            strategy: options.strategy.unwrap_or(self.strategy),
            interval: options.progress_interval.unwrap_or(self.progress_interval),
        };
        dispatch::submit(ctx, payload, options.progress).await
    }

    /// Submit and wait for the result in one round trip, without progress.
    pub async fn do_request(&self, payload: Payload) -> Result<JobResult, ClientError> {
        self.submit(payload, SubmitOptions::without_progress())
            .await?
            .wait()
            .await
    }

    /// Submit, report every progress update to `on_progress`, then return the
    /// result.
    pub async fn do_request_with_progress<F>(
        &self,
        payload: Payload,
        on_progress: F,
    ) -> Result<JobResult, ClientError>
    where
        F: FnMut(&ProgressUpdate),
    {
        match self.submit(payload, SubmitOptions::with_progress()).await? {
            Submission::Completed(result) => Ok(result),
            Submission::Running(job) => job.run(on_progress).await,
        }
    }

    fn read_credentials(&self) -> RwLockReadGuard<'_, Credentials> {
        self.credentials.read().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned reading session credentials: {e}");
            e.into_inner()
        })
    }
}
