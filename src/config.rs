use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HpcqError, Result};

pub const DEFAULT_QUEUE_API_BASE: &str = "https://api.cloudflare.com/client/v4";
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 30;
pub const DEFAULT_IMAGE_REFRESH_HOURS: u64 = 24;
pub const DEFAULT_APPTAINER_BIN: &str = "apptainer";
pub const DEFAULT_IMAGE_FILE: &str = "hpcq-runtime.sif";
pub const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 86_400;

/// Immutable process-wide configuration, loaded once at startup from the
/// environment. Components receive a shared reference; nothing mutates it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Queue service REST base, e.g. `https://api.cloudflare.com/client/v4`.
    /// Overridable so tests can point the client at a local mock.
    pub queue_api_base: String,
    pub account_id: String,
    pub jobs_queue_id: String,
    pub results_queue_id: String,
    /// Bearer token for queue pull/ack/send.
    pub api_token: String,
    /// Shared secret for the producer endpoint (`x-api-key`).
    pub api_key: Option<String>,

    /// Root of the on-disk tree (workspaces, runtime image, pid files).
    pub root: PathBuf,
    /// Per-job workspace root; defaults to `<root>/results`.
    pub results_dir: PathBuf,

    pub apptainer_bin: String,
    pub apptainer_image: PathBuf,
    pub apptainer_oci_ref: Option<String>,
    pub apptainer_sif_url: Option<String>,
    /// Extra `host:guest` bind specs passed to the container runtime.
    pub extra_binds: Vec<String>,
    /// Optional registry credentials for the manifest/token endpoints.
    pub registry_user: Option<String>,
    pub registry_password: Option<String>,

    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub image_refresh_hours: u64,
}

fn req(name: &'static str) -> Result<String> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(HpcqError::MissingEnv(name)),
    }
}

fn opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_seconds(name: &'static str, default: u64) -> Result<Duration> {
    match opt(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| HpcqError::InvalidConfig(format!("{name} must be an integer: {raw}"))),
    }
}

impl Config {
    /// Load configuration from the environment. The queue token and routing
    /// ids are required for every role; `API_KEY` is validated lazily by the
    /// producer because worker-only deployments never hold it.
    pub fn load() -> Result<Self> {
        let root = opt("HPCQ_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let results_dir = opt("RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("results"));
        let apptainer_image = opt("APPTAINER_IMAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("runtime").join(DEFAULT_IMAGE_FILE));

        let image_refresh_hours = match opt("IMAGE_REFRESH_HOURS") {
            None => DEFAULT_IMAGE_REFRESH_HOURS,
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                HpcqError::InvalidConfig(format!("IMAGE_REFRESH_HOURS must be an integer: {raw}"))
            })?,
        };

        Ok(Self {
            queue_api_base: opt("QUEUE_API_BASE")
                .unwrap_or_else(|| DEFAULT_QUEUE_API_BASE.to_string()),
            account_id: req("CF_ACCOUNT_ID")?,
            jobs_queue_id: req("CF_JOBS_QUEUE_ID")?,
            results_queue_id: req("CF_RESULTS_QUEUE_ID")?,
            api_token: req("CF_QUEUES_API_TOKEN")?,
            api_key: opt("API_KEY"),
            root,
            results_dir,
            apptainer_bin: opt("APPTAINER_BIN").unwrap_or_else(|| DEFAULT_APPTAINER_BIN.to_string()),
            apptainer_image,
            apptainer_oci_ref: opt("APPTAINER_OCI_REF"),
            apptainer_sif_url: opt("APPTAINER_SIF_URL"),
            extra_binds: opt("APPTAINER_BIND")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            registry_user: opt("OCI_REGISTRY_USER"),
            registry_password: opt("OCI_REGISTRY_PASSWORD"),
            poll_interval: parse_seconds("POLL_INTERVAL_SECONDS", DEFAULT_POLL_INTERVAL_SECONDS)?,
            heartbeat_interval: parse_seconds("HEARTBEAT_SECONDS", DEFAULT_HEARTBEAT_SECONDS)?,
            image_refresh_hours,
        })
    }

    /// The producer refuses to start without its shared secret.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or(HpcqError::MissingEnv("API_KEY"))
    }

    pub fn messages_url(&self, queue_id: &str) -> String {
        format!(
            "{}/accounts/{}/queues/{}/messages",
            self.queue_api_base.trim_end_matches('/'),
            self.account_id,
            queue_id
        )
    }
}
