//! Local-side results consumer.
//!
//! Pulls result events, writes per-job artefacts under `local-results/`,
//! keeps the heartbeat snapshot for `status`, and backs the `logs`
//! subcommand. Everything pulled is acked; durability toward local disk is
//! at-least-once, so all writes are idempotent per job id.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::job::ResultEvent;
use crate::layout::{atomic_write_json, Layout};
use crate::queue::{Queue, QueueClient};
use crate::worker::executor::TAIL_BYTES;

const RESULTS_BATCH_SIZE: u32 = 100;
const RESULTS_VISIBILITY: Duration = Duration::from_secs(120);
/// A heartbeat older than this marks the remote worker as stale.
pub const HEARTBEAT_MAX_AGE: Duration = Duration::from_secs(90);

pub struct ResultsConsumer {
    config: Arc<Config>,
    queue: QueueClient,
    layout: Layout,
    /// Bytes already appended per job and stream, for offset dedup across
    /// repeated `running` deliveries.
    offsets: HashMap<String, StreamOffsets>,
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamOffsets {
    stdout: u64,
    stderr: u64,
}

impl ResultsConsumer {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let queue = QueueClient::new(&config)?;
        let layout = Layout::new(&config);
        Ok(Self { config, queue, layout, offsets: HashMap::new() })
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Results consumer started");
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.process_once().await {
                Ok(received) if received > 0 => continue,
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "Results pull failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Pull one batch, persist every event, ack everything. Returns the
    /// number of messages handled.
    pub async fn process_once(&mut self) -> Result<usize> {
        let messages = self
            .queue
            .pull(Queue::Results, RESULTS_BATCH_SIZE, RESULTS_VISIBILITY)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }

        let mut lease_ids = Vec::with_capacity(messages.len());
        for message in &messages {
            lease_ids.push(message.lease_id.clone());
            let Some(body) = &message.body else {
                tracing::warn!(lease_id = %message.lease_id, "Skipping undecodable result event");
                continue;
            };
            if let Err(err) = self.record_event(body) {
                tracing::error!(error = %err, "Failed to persist result event");
            }
        }

        let count = lease_ids.len();
        self.queue.ack(Queue::Results, &lease_ids).await?;
        Ok(count)
    }

    fn record_event(&mut self, body: &Value) -> Result<()> {
        append_jsonl(&self.layout.results_cache_path(), body)?;

        let Ok(event) = serde_json::from_value::<ResultEvent>(body.clone()) else {
            // Foreign event shape; the cache line above is all we keep.
            return Ok(());
        };

        match &event {
            ResultEvent::Heartbeat { .. } => {
                atomic_write_json(&self.layout.heartbeat_snapshot_path(), body)?;
            }
            ResultEvent::Running {
                job_id,
                stdout_tail,
                stderr_tail,
                bytes_read_stdout,
                bytes_read_stderr,
                ..
            } => {
                let offsets = self.offsets.entry(job_id.clone()).or_default();
                offsets.stdout = append_at_offset(
                    &self.layout.local_stdout_log(job_id),
                    stdout_tail.as_bytes(),
                    *bytes_read_stdout,
                    offsets.stdout,
                )?;
                offsets.stderr = append_at_offset(
                    &self.layout.local_stderr_log(job_id),
                    stderr_tail.as_bytes(),
                    *bytes_read_stderr,
                    offsets.stderr,
                )?;
            }
            ResultEvent::Completed { job_id, stdout_tail, stderr_tail, .. }
            | ResultEvent::Failed { job_id, stdout_tail, stderr_tail, .. } => {
                append_with_overlap(&self.layout.local_stdout_log(job_id), stdout_tail.as_bytes())?;
                append_with_overlap(&self.layout.local_stderr_log(job_id), stderr_tail.as_bytes())?;
                // Content is idempotent per job id, so a duplicate terminal
                // delivery rewrites the same record.
                atomic_write_json(&self.layout.local_result_json(job_id), body)?;
                self.offsets.remove(job_id);
                tracing::info!(job_id = %job_id, status = event.status(), "Terminal result stored");
            }
        }
        Ok(())
    }
}

/// Append the unseen portion of a running tail. `total_bytes` is the
/// absolute stream position after the tail; everything before
/// `written_bytes` is already on disk.
fn append_at_offset(
    path: &Path,
    tail: &[u8],
    total_bytes: u64,
    written_bytes: u64,
) -> Result<u64> {
    if total_bytes <= written_bytes {
        return Ok(written_bytes);
    }
    let new_bytes = total_bytes - written_bytes;
    // The tail only holds the last TAIL_BYTES; a larger gap means the middle
    // of the stream was never shipped.
    let take = (new_bytes as usize).min(tail.len());
    if (new_bytes as usize) > tail.len() {
        tracing::debug!(
            path = %path.display(),
            missing = new_bytes as usize - tail.len(),
            "Tail window skipped bytes not carried by events"
        );
    }
    let chunk = &tail[tail.len() - take..];

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(chunk)?;
    Ok(total_bytes)
}

/// Append a terminal tail, trimming the longest overlap between what the
/// file already ends with and what the tail starts with. Terminal events
/// carry no byte counters, so dedup is structural.
fn append_with_overlap(path: &Path, tail: &[u8]) -> Result<()> {
    if tail.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let existing_tail = read_last_bytes(path, TAIL_BYTES)?;
    let max_overlap = existing_tail.len().min(tail.len());
    let overlap = (0..=max_overlap)
        .rev()
        .find(|&k| existing_tail[existing_tail.len() - k..] == tail[..k])
        .unwrap_or(0);

    let remainder = &tail[overlap..];
    if remainder.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(remainder)?;
    Ok(())
}

fn read_last_bytes(path: &Path, limit: usize) -> Result<Vec<u8>> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Ok(Vec::new());
    };
    let len = file.metadata()?.len();
    let start = len.saturating_sub(limit as u64);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn append_jsonl(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(value)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Snapshot of worker liveness derived from pid files and the last
/// heartbeat, printed by `status`.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub supervisor_running: bool,
    pub supervisor_pid: Option<u32>,
    pub worker_running: bool,
    pub worker_pid: Option<u32>,
    pub hpc_running_remote: Option<bool>,
    pub hpc_last_heartbeat: Option<Value>,
    pub hpc_heartbeat_age_seconds: Option<f64>,
}

pub fn status_snapshot(layout: &Layout) -> StatusSnapshot {
    let supervisor_pid = crate::layout::read_pid_file(&layout.supervisor_pid_file());
    let worker_pid = crate::layout::read_pid_file(&layout.worker_pid_file());
    let supervisor_running = supervisor_pid.map(crate::layout::pid_alive).unwrap_or(false);
    let worker_running = worker_pid.map(crate::layout::pid_alive).unwrap_or(false);

    let heartbeat: Option<Value> = std::fs::read_to_string(layout.heartbeat_snapshot_path())
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());

    let age_seconds = heartbeat
        .as_ref()
        .and_then(|hb| hb.get("timestamp"))
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
        .map(|ts| (Utc::now() - ts).num_milliseconds().max(0) as f64 / 1000.0);

    let hpc_running_remote = match (age_seconds, supervisor_running) {
        (Some(age), _) => Some(age <= HEARTBEAT_MAX_AGE.as_secs_f64()),
        // This machine hosts the worker itself; liveness is local.
        (None, true) => Some(true),
        (None, false) => None,
    };

    StatusSnapshot {
        supervisor_running,
        supervisor_pid: if supervisor_running { supervisor_pid } else { None },
        worker_running,
        worker_pid: if worker_running { worker_pid } else { None },
        hpc_running_remote,
        hpc_last_heartbeat: heartbeat,
        hpc_heartbeat_age_seconds: age_seconds,
    }
}

/// Artefacts for one job as the `logs` subcommand presents them. Falls back
/// to the newest cached event when the per-job files are absent.
pub struct JobLogs {
    pub record: Option<Value>,
    pub stdout: String,
    pub stderr: String,
    pub source: &'static str,
}

pub fn load_job_logs(layout: &Layout, job_id: &str) -> Option<JobLogs> {
    let record_path = layout.local_result_json(job_id);
    if record_path.exists() {
        let record = std::fs::read_to_string(&record_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let stdout = std::fs::read_to_string(layout.local_stdout_log(job_id)).unwrap_or_default();
        let stderr = std::fs::read_to_string(layout.local_stderr_log(job_id)).unwrap_or_default();
        return Some(JobLogs { record, stdout, stderr, source: "local-results" });
    }

    // Newest cached event wins; the cache is append-only.
    let cache = std::fs::read_to_string(layout.results_cache_path()).ok()?;
    let mut last_match: Option<Value> = None;
    for line in cache.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line) else { continue };
        if event.get("job_id").and_then(Value::as_str) == Some(job_id) {
            last_match = Some(event);
        }
    }
    let event = last_match?;
    let stdout = event.get("stdout_tail").and_then(Value::as_str).unwrap_or("").to_string();
    let stderr = event.get("stderr_tail").and_then(Value::as_str).unwrap_or("").to_string();
    Some(JobLogs { record: Some(event), stdout, stderr, source: "results-cache" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_append_skips_already_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        let written = append_at_offset(&path, b"hello ", 6, 0).unwrap();
        assert_eq!(written, 6);
        // Redelivered event with the same counter is a no-op.
        let written = append_at_offset(&path, b"hello ", 6, written).unwrap();
        assert_eq!(written, 6);
        let written = append_at_offset(&path, b"hello world", 11, written).unwrap();
        assert_eq!(written, 11);

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn overlap_append_deduplicates_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        append_with_overlap(&path, b"line one\nline two\n").unwrap();
        append_with_overlap(&path, b"line two\nline three\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "line one\nline two\nline three\n"
        );
    }

    #[test]
    fn overlap_append_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        append_with_overlap(&path, b"endpoint-ok\n").unwrap();
        append_with_overlap(&path, b"endpoint-ok\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "endpoint-ok\n");
    }
}
