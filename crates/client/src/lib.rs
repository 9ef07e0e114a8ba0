// crates/client/src/lib.rs
//! Client for a remote compute-job API.
//!
//! Flow: [`ApiClient`] → [`Session::login`] → [`Session::submit`] →
//! [`RunningJob`] (progress + result), with [`JobHandle::cancel`] available
//! at any point after dispatch.
//!
//! ```ignore
//! let api = ApiClient::new(ClientConfig::load(None)?)?;
//! let session = api.session("llama3_chat", "alice", "secret-key");
//! session.login(None, None).await?;
//!
//! let mut payload = Payload::new();
//! payload.insert("prompt", "Tell me a story")?;
//! let result = session
//!     .do_request_with_progress(payload, |u| println!("{:.0}%", u.snapshot.progress))
//!     .await?;
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod session;
pub mod sync;
pub mod types;

pub use api::ApiClient;
pub use codec::{encode_params, encode_value, parse_param_value, Payload};
pub use config::{client_version_string, ClientConfig};
pub use dispatch::{SubmitOptions, Submission};
pub use error::{ClientError, CodecError, ConfigError};
pub use job::{JobHandle, RunningJob};
pub use session::Session;
pub use sync::SyncStrategy;
pub use types::{JobId, JobResult, JobState, KeyValidation, ProgressSnapshot, ProgressUpdate};
