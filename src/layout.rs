//! On-disk layout shared by the worker, supervisor and results consumer.
//!
//! All terminal records are written with the write-temp-then-rename pattern
//! so readers never observe a half-written file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Config;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    results_dir: PathBuf,
}

impl Layout {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.root.clone(),
            results_dir: config.results_dir.clone(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Per-job workspace, bind-mounted into the container as `/work`.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.results_dir.join(job_id)
    }

    pub fn done_marker(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("done.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("hpc-consumer")
    }

    pub fn supervisor_pid_file(&self) -> PathBuf {
        self.state_dir().join("hpcq_supervisor.pid")
    }

    pub fn worker_pid_file(&self) -> PathBuf {
        self.state_dir().join("hpcq_worker.pid")
    }

    /// Touched by an operator (or an update job) to request a graceful
    /// worker restart: the loop drains and exits 0.
    pub fn reload_request_path(&self) -> PathBuf {
        self.state_dir().join("reload_requested")
    }

    pub fn supervisor_log_file(&self) -> PathBuf {
        self.state_dir().join("hpcq_worker.log")
    }

    pub fn local_results_dir(&self) -> PathBuf {
        self.root.join("local-results")
    }

    pub fn local_result_json(&self, job_id: &str) -> PathBuf {
        self.local_results_dir().join(format!("{job_id}.json"))
    }

    pub fn local_stdout_log(&self, job_id: &str) -> PathBuf {
        self.local_results_dir().join(format!("{job_id}.stdout.log"))
    }

    pub fn local_stderr_log(&self, job_id: &str) -> PathBuf {
        self.local_results_dir().join(format!("{job_id}.stderr.log"))
    }

    /// Last heartbeat seen by the results consumer, read by `status`.
    pub fn heartbeat_snapshot_path(&self) -> PathBuf {
        self.root.join("local-consumer").join("hpc_status.json")
    }

    /// Append-only cache of every result event, the `logs` fallback source.
    pub fn results_cache_path(&self) -> PathBuf {
        self.root.join("local-consumer").join("results_cache.jsonl")
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory, then
/// rename over the destination.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)
}

/// Write this process's pid. Best-effort removal is the owner's concern.
pub fn write_pid_file(path: &Path) -> Result<()> {
    atomic_write(path, std::process::id().to_string().as_bytes())
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Liveness probe. `/proc` covers Linux; `kill -0` covers hosts without it.
pub fn pid_alive(pid: u32) -> bool {
    if Path::new("/proc").is_dir() {
        return Path::new(&format!("/proc/{pid}")).exists();
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
