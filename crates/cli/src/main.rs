// crates/cli/src/main.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use modelapi_client::{
    parse_param_value, ApiClient, ClientConfig, ClientError, JobResult, Payload, ProgressUpdate,
    Session, SubmitOptions, Submission, SyncStrategy,
};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "modelapi", version, about = "Submit jobs to a model API server")]
struct Cli {
    /// API server base URL (overrides MODELAPI_SERVER and the config file)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Config file (default: <config dir>/modelapi/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    user: Option<String>,

    /// API key (overrides MODELAPI_KEY)
    #[arg(long, global = true)]
    key: Option<String>,

    /// Progress poll interval / stream reconnect delay in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check an API key without logging in
    ValidateKey,
    /// Log in to an endpoint and print the session key
    Login {
        #[arg(long)]
        endpoint: String,
    },
    /// Submit a job and wait for its result
    Run {
        #[arg(long)]
        endpoint: String,
        /// Job parameter; the value is parsed as JSON when possible
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        /// JSON object file with job parameters, merged before --param
        #[arg(long)]
        params_file: Option<PathBuf>,
        /// Attach a file as a base64 data URL
        #[arg(long = "attach", value_name = "KEY=PATH")]
        attachments: Vec<String>,
        /// Follow progress over the server's event stream instead of polling
        #[arg(long)]
        stream: bool,
        /// Wait for the result in a single request, without progress
        #[arg(long)]
        no_progress: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,modelapi_client=info,modelapi=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let api = ApiClient::new(config).context("invalid client configuration")?;

    match cli.command {
        Command::ValidateKey => {
            let key = api_key(&api, cli.key)?;
            let validation = api.validate_key(&key).await?;
            match validation.ep_version {
                Some(version) => println!("key valid (api version {version})"),
                None => println!("key valid"),
            }
        }
        Command::Login { endpoint } => {
            let session = open_session(&api, &endpoint, cli.user, cli.key)?;
            let auth_key = session.login(None, None).await?;
            println!("{auth_key}");
        }
        Command::Run {
            endpoint,
            params,
            params_file,
            attachments,
            stream,
            no_progress,
        } => {
            let payload = build_payload(params_file.as_deref(), &params, &attachments)?;
            let strategy = if stream {
                SyncStrategy::Streaming
            } else {
                SyncStrategy::Polling
            };
            let session =
                open_session(&api, &endpoint, cli.user, cli.key)?.with_strategy(strategy);
            session.login(None, None).await?;

            let result = match run_job(&session, payload.clone(), !no_progress).await {
                Err(e) if e.is_session_expired() => {
                    warn!(%endpoint, error = %e, "session expired, logging in again");
                    session.login(None, None).await?;
                    run_job(&session, payload, !no_progress).await?
                }
                other => other?,
            };
            println!("{}", serde_json::to_string_pretty(&result.payload)?);
        }
    }
    Ok(())
}

/// Config file / env defaults, then command-line overrides.
fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(server) = &cli.server {
        config = config.with_api_server(server.clone());
    }
    if let Some(ms) = cli.interval_ms {
        config = config.with_progress_interval(Duration::from_millis(ms));
    }
    Ok(config)
}

fn api_key(api: &ApiClient, flag: Option<String>) -> Result<String> {
    flag.or_else(|| api.config().api_key.clone())
        .context("no API key: pass --key, set MODELAPI_KEY, or add api_key to the config file")
}

fn open_session(
    api: &ApiClient,
    endpoint: &str,
    user: Option<String>,
    key: Option<String>,
) -> Result<Session> {
    let user = user
        .or_else(|| api.config().user.clone())
        .context("no user: pass --user, set MODELAPI_USER, or add user to the config file")?;
    let key = api_key(api, key)?;
    Ok(api.session(endpoint, user, key))
}

/// Submit once and follow the job to its end. Ctrl-C cancels the job.
async fn run_job(
    session: &Session,
    payload: Payload,
    show_progress: bool,
) -> Result<JobResult, ClientError> {
    let options = if show_progress {
        SubmitOptions::with_progress()
    } else {
        SubmitOptions::without_progress()
    };
    let job = match session.submit(payload, options).await? {
        Submission::Completed(result) => return Ok(result),
        Submission::Running(job) => job,
    };
    info!(job_id = %job.job_id(), "job queued, press Ctrl-C to cancel");

    let handle = job.handle().clone();
    let bar = show_progress.then(progress_bar);
    let outcome = tokio::select! {
        outcome = job.run(|update| {
            if let Some(bar) = &bar {
                render(bar, update);
            }
        }) => outcome,
        _ = tokio::signal::ctrl_c() => {
            if let Err(e) = handle.cancel().await {
                warn!(job_id = %handle.job_id(), error = %e, "server did not confirm cancel");
            }
            Err(ClientError::Canceled { job_id: handle.job_id().to_string() })
        }
    };
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    outcome
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner} [{bar:40}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn render(bar: &ProgressBar, update: &ProgressUpdate) {
    let snapshot = &update.snapshot;
    bar.set_position(snapshot.progress.clamp(0.0, 100.0) as u64);
    bar.set_message(progress_message(update));
}

fn progress_message(update: &ProgressUpdate) -> String {
    let snapshot = &update.snapshot;
    if snapshot.queue_position > 0 {
        format!("queued, position {}", snapshot.queue_position)
    } else if snapshot.estimate_secs >= 0.0 {
        format!("{} ({:.0}s left)", update.state, snapshot.estimate_secs)
    } else {
        update.state.to_string()
    }
}

/// Merge the params file, `KEY=VALUE` pairs, and attachments, in that order.
fn build_payload(
    params_file: Option<&Path>,
    params: &[String],
    attachments: &[String],
) -> Result<Payload> {
    let mut payload = match params_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let map: Map<String, Value> = serde_json::from_str(&text)
                .with_context(|| format!("{} is not a JSON object", path.display()))?;
            Payload::from_map(map)
        }
        None => Payload::new(),
    };

    for raw in params {
        let (key, value) = split_assignment(raw)?;
        payload.insert(key, &parse_param_value(value))?;
    }
    for raw in attachments {
        let (key, path) = split_assignment(raw)?;
        let path = Path::new(path);
        let bytes =
            std::fs::read(path).with_context(|| format!("reading attachment {}", path.display()))?;
        payload.insert_binary(key, guess_mime(path), &bytes);
    }
    Ok(payload)
}

fn split_assignment(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => bail!("expected KEY=VALUE, got `{raw}`"),
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
