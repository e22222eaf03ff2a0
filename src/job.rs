use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DEFAULT_JOB_TIMEOUT_SECONDS;

/// Envelope placed on the jobs queue by the producer.
///
/// `job_id` is the idempotency key for the whole pipeline: any redelivery of
/// the same message must resolve to the same terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Container,
    Host,
}

impl ExecMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "host" => ExecMode::Host,
            _ => ExecMode::Container,
        }
    }
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Container => write!(f, "container"),
            ExecMode::Host => write!(f, "host"),
        }
    }
}

/// A file shipped inline with the job and materialised into the workspace
/// before the command runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    pub path: String,
    pub content_b64: String,
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

fn default_file_mode() -> String {
    "644".to_string()
}

/// Typed view over the free-form `input` map. Fields the executor consumes
/// are extracted here with documented defaults; everything else is ignored.
#[derive(Debug, Clone, Copy)]
pub struct JobInput<'a>(pub &'a Value);

impl<'a> JobInput<'a> {
    fn str_field(&self, key: &str) -> Option<&'a str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn command(&self) -> &'a str {
        self.str_field("command").unwrap_or("")
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.str_field("exec_mode").map(ExecMode::parse).unwrap_or(ExecMode::Container)
    }

    /// Runner prepended to the staged file for run-file jobs. `None` means
    /// the job is not a run-file job; an empty string execs the file directly.
    pub fn runner(&self) -> Option<&'a str> {
        self.str_field("runner")
    }

    pub fn file_name(&self) -> Option<&'a str> {
        self.str_field("file_name")
    }

    pub fn file_content_b64(&self) -> Option<&'a str> {
        self.str_field("file_content_b64")
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.0
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .filter(|&t| t > 0)
            .unwrap_or(DEFAULT_JOB_TIMEOUT_SECONDS)
    }

    /// Files to stage into the workspace. The single `file_name` /
    /// `file_content_b64` pair is folded in as a one-element list.
    pub fn staged_files(&self) -> Vec<StagedFile> {
        let mut files: Vec<StagedFile> = self
            .0
            .get("local_files")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        if let (Some(name), Some(content)) = (self.file_name(), self.file_content_b64()) {
            files.push(StagedFile {
                path: name.to_string(),
                content_b64: content.to_string(),
                mode: default_file_mode(),
            });
        }
        files
    }
}

/// Failure classification carried in `failed` terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Poison,
    ImageUnavailable,
    LaunchFailed,
    Timeout,
    NonzeroExit,
    TransportError,
    RateLimited,
    WorkerShutdown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Poison => "poison",
            ErrorKind::ImageUnavailable => "image_unavailable",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NonzeroExit => "nonzero_exit",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::WorkerShutdown => "worker_shutdown",
        };
        write!(f, "{label}")
    }
}

/// Event published to the results queue, tagged by `status`.
///
/// `heartbeat` carries no job id; `running` may repeat; exactly one
/// `completed` or `failed` is intended per job attempt, but consumers must
/// tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResultEvent {
    Heartbeat {
        /// Always null; present so consumers can key uniformly on `job_id`.
        job_id: Option<String>,
        hpc_running_remote: bool,
        hostname: String,
        timestamp: DateTime<Utc>,
        worker_version: String,
    },
    Running {
        job_id: String,
        stdout_tail: String,
        stderr_tail: String,
        bytes_read_stdout: u64,
        bytes_read_stderr: u64,
        timestamp: DateTime<Utc>,
    },
    Completed {
        job_id: String,
        exit_code: i32,
        duration_seconds: f64,
        stdout_tail: String,
        stderr_tail: String,
        result_pointer: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job_id: String,
        exit_code: Option<i32>,
        error_kind: ErrorKind,
        error_detail: String,
        duration_seconds: f64,
        stdout_tail: String,
        stderr_tail: String,
        timestamp: DateTime<Utc>,
    },
}

impl ResultEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ResultEvent::Heartbeat { .. } => None,
            ResultEvent::Running { job_id, .. }
            | ResultEvent::Completed { job_id, .. }
            | ResultEvent::Failed { job_id, .. } => Some(job_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultEvent::Completed { .. } | ResultEvent::Failed { .. })
    }

    pub fn status(&self) -> &'static str {
        match self {
            ResultEvent::Heartbeat { .. } => "heartbeat",
            ResultEvent::Running { .. } => "running",
            ResultEvent::Completed { .. } => "completed",
            ResultEvent::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_defaults() {
        let value = json!({});
        let input = JobInput(&value);
        assert_eq!(input.command(), "");
        assert_eq!(input.exec_mode(), ExecMode::Container);
        assert_eq!(input.timeout_seconds(), DEFAULT_JOB_TIMEOUT_SECONDS);
        assert!(input.staged_files().is_empty());
    }

    #[test]
    fn input_host_mode_and_timeout() {
        let value = json!({"exec_mode": "HOST", "timeout_seconds": 120});
        let input = JobInput(&value);
        assert_eq!(input.exec_mode(), ExecMode::Host);
        assert_eq!(input.timeout_seconds(), 120);
    }

    #[test]
    fn single_file_pair_becomes_staged_file() {
        let value = json!({"file_name": "job.sh", "file_content_b64": "ZWNobyA0Mg=="});
        let files = JobInput(&value).staged_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "job.sh");
        assert_eq!(files[0].mode, "644");
    }

    #[test]
    fn result_event_round_trips_with_status_tag() {
        let event = ResultEvent::Failed {
            job_id: "alpine-lichen-0a1b2c".to_string(),
            exit_code: Some(2),
            error_kind: ErrorKind::NonzeroExit,
            error_detail: "exit status 2".to_string(),
            duration_seconds: 0.5,
            stdout_tail: String::new(),
            stderr_tail: "boom".to_string(),
            timestamp: Utc::now(),
        };

        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["status"], "failed");
        assert_eq!(raw["error_kind"], "nonzero_exit");

        let back: ResultEvent = serde_json::from_value(raw).unwrap();
        assert!(back.is_terminal());
        assert_eq!(back.job_id(), Some("alpine-lichen-0a1b2c"));
    }

    #[test]
    fn heartbeat_serialises_null_job_id() {
        let event = ResultEvent::Heartbeat {
            job_id: None,
            hpc_running_remote: false,
            hostname: "node01".to_string(),
            timestamp: Utc::now(),
            worker_version: "0.3.0".to_string(),
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert!(raw["job_id"].is_null());
        assert_eq!(raw["status"], "heartbeat");
    }
}
