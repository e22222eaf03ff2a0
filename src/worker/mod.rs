//! The HPC-side pull consumer.
//!
//! One process, three concurrent activities: the poll/dispatch loop (this
//! module), the heartbeat ticker, and — while a job runs — the executor's
//! stream readers and tail emitter. Jobs run strictly one at a time.
//!
//! # Ack discipline
//!
//! A job message is acknowledged only after its terminal event has been
//! accepted by the results queue. Anything else (send failure, shutdown
//! mid-job) leaves the lease to expire so the message redelivers, where the
//! `done.json` idempotence marker short-circuits re-execution.

pub mod executor;
pub mod heartbeat;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use executor::JobExecutor;
pub use heartbeat::{HeartbeatSender, WORKER_VERSION};

use crate::config::{Config, DEFAULT_JOB_TIMEOUT_SECONDS};
use crate::error::{HpcqError, Result};
use crate::image::ImageRefresher;
use crate::job::{ErrorKind, ExecMode, JobInput, JobMessage, ResultEvent};
use crate::layout::{write_pid_file, Layout};
use crate::queue::{PulledMessage, Queue, QueueClient};

const TERMINAL_SEND_ATTEMPTS: u32 = 5;
const TERMINAL_SEND_BACKOFF: Duration = Duration::from_millis(500);

/// Visibility window requested on every pull. Sized so the single lease
/// covers the longest job the executor will allow; there is no in-flight
/// extend, so overruns fall back to redelivery + idempotence.
fn pull_visibility() -> Duration {
    let secs = (DEFAULT_JOB_TIMEOUT_SECONDS + 60).clamp(600, 43_200);
    Duration::from_secs(secs)
}

/// How the loop finished a poll cycle, used to decide exit vs sleep.
enum CycleOutcome {
    Idle,
    Worked,
    ShuttingDown,
}

pub struct ConsumerLoop {
    config: Arc<Config>,
    queue: Arc<QueueClient>,
    executor: JobExecutor,
    refresher: ImageRefresher,
    layout: Layout,
    job_in_flight: Arc<AtomicBool>,
}

impl ConsumerLoop {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let queue = Arc::new(QueueClient::new(&config)?);
        let refresher = ImageRefresher::new(&config)?;
        let layout = Layout::new(&config);
        Ok(Self {
            executor: JobExecutor::new(config.clone()),
            queue,
            refresher,
            layout,
            job_in_flight: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Run until shutdown or a drain request. Blocks on a startup image
    /// refresh first; a worker without any usable container image must not
    /// start pulling container jobs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(self.layout.results_dir())?;
        write_pid_file(&self.layout.worker_pid_file())?;

        if self.config.apptainer_oci_ref.is_some() || self.config.apptainer_sif_url.is_some() {
            let outcome = self.refresher.ensure_fresh().await?;
            tracing::info!(outcome = ?outcome, "Startup image refresh done");
        } else {
            tracing::warn!("No image source configured; container jobs will fail at launch");
        }

        // Running-tail and heartbeat events flow through this channel to a
        // single publisher task; their delivery is best-effort by design.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ResultEvent>();
        let publisher = tokio::spawn(publish_events(self.queue.clone(), event_rx));

        let heartbeat = HeartbeatSender::new(
            self.config.heartbeat_interval,
            self.job_in_flight.clone(),
        );
        let heartbeat_tx = event_tx.clone();
        let heartbeat_cancel = cancel.clone();
        let heartbeat_task = tokio::spawn(async move {
            heartbeat.run(heartbeat_tx, heartbeat_cancel).await;
        });

        tracing::info!(
            poll_interval_s = self.config.poll_interval.as_secs(),
            heartbeat_s = self.config.heartbeat_interval.as_secs(),
            version = WORKER_VERSION,
            "Pull consumer started"
        );

        let exit = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            if self.reload_requested() {
                tracing::info!("Reload requested; draining and exiting for supervisor restart");
                let _ = std::fs::remove_file(self.layout.reload_request_path());
                break Ok(());
            }

            match self.poll_once(&event_tx, &cancel).await {
                Ok(CycleOutcome::Worked) => continue,
                Ok(CycleOutcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Ok(CycleOutcome::ShuttingDown) => break Ok(()),
                Err(err) => {
                    tracing::error!(error = %err, "Poll cycle failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        };

        heartbeat_task.abort();
        drop(event_tx);
        // Let the publisher flush whatever is already queued.
        let _ = tokio::time::timeout(Duration::from_secs(5), publisher).await;
        let _ = std::fs::remove_file(self.layout.worker_pid_file());
        exit
    }

    fn reload_requested(&self) -> bool {
        self.layout.reload_request_path().exists()
    }

    /// One poll cycle: pull a single message and process it to completion.
    async fn poll_once(
        &self,
        event_tx: &mpsc::UnboundedSender<ResultEvent>,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let messages = self
            .queue
            .pull(Queue::Jobs, 1, pull_visibility())
            .await?;
        let Some(message) = messages.into_iter().next() else {
            return Ok(CycleOutcome::Idle);
        };

        self.process_message(message, event_tx, cancel).await
    }

    async fn process_message(
        &self,
        message: PulledMessage,
        event_tx: &mpsc::UnboundedSender<ResultEvent>,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let job = match parse_job(&message) {
            Ok(job) => job,
            Err(poison) => {
                // Drain the poison: ack unconditionally, and surface a
                // synthetic failure when the id is recoverable.
                tracing::warn!(
                    lease_id = %message.lease_id,
                    attempts = message.attempts,
                    detail = %poison.detail,
                    "Dropping undecodable job message"
                );
                if let Some(job_id) = poison.job_id {
                    let event = ResultEvent::Failed {
                        job_id,
                        exit_code: None,
                        error_kind: ErrorKind::Poison,
                        error_detail: poison.detail,
                        duration_seconds: 0.0,
                        stdout_tail: String::new(),
                        stderr_tail: String::new(),
                        timestamp: Utc::now(),
                    };
                    if let Err(err) = self.send_terminal(&event).await {
                        tracing::warn!(error = %err, "Failed to emit poison event");
                    }
                }
                self.queue.ack(Queue::Jobs, &[message.lease_id]).await?;
                return Ok(CycleOutcome::Worked);
            }
        };

        // Best-effort freshness probe; only a container job with no usable
        // image at all is a reason to hold off.
        if JobInput(&job.input).exec_mode() == ExecMode::Container {
            match self.refresher.refresh_best_effort().await {
                Ok(outcome) => tracing::debug!(outcome = ?outcome, "Pre-job image probe"),
                Err(err) => {
                    tracing::error!(job_id = %job.job_id, error = %err, "No usable image, releasing lease");
                    self.queue
                        .retry(Queue::Jobs, &[message.lease_id], self.config.poll_interval)
                        .await?;
                    tokio::time::sleep(self.config.poll_interval).await;
                    return Ok(CycleOutcome::Worked);
                }
            }
        }

        self.job_in_flight.store(true, Ordering::Relaxed);
        let terminal = self.executor.execute(&job, event_tx, cancel).await;
        self.job_in_flight.store(false, Ordering::Relaxed);

        if let ResultEvent::Failed { error_kind: ErrorKind::WorkerShutdown, .. } = &terminal {
            // Best-effort emission, deliberately no ack: the message must
            // redeliver to another attempt.
            if let Err(err) = self.queue.send(Queue::Results, &serde_json::to_value(&terminal)?).await {
                tracing::warn!(job_id = %job.job_id, error = %err, "Shutdown terminal emission failed");
            }
            return Ok(CycleOutcome::ShuttingDown);
        }

        match self.send_terminal(&terminal).await {
            Ok(()) => {
                self.queue.ack(Queue::Jobs, &[message.lease_id]).await?;
                tracing::info!(
                    job_id = %job.job_id,
                    status = terminal.status(),
                    "Job finished and acknowledged"
                );
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.job_id,
                    error = %err,
                    "Terminal event could not be enqueued; leaving lease to redeliver"
                );
            }
        }
        Ok(CycleOutcome::Worked)
    }

    /// Enqueue the terminal event, retrying transport failures. The 429 path
    /// inside `send` has its own backoff; this loop covers everything else.
    async fn send_terminal(&self, event: &ResultEvent) -> Result<()> {
        let body = serde_json::to_value(event)?;
        let mut delay = TERMINAL_SEND_BACKOFF;
        let mut last_err = None;
        for attempt in 1..=TERMINAL_SEND_ATTEMPTS {
            match self.queue.send(Queue::Results, &body).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Terminal event send failed");
                    last_err = Some(err);
                    if attempt < TERMINAL_SEND_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(8));
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| HpcqError::Transport("terminal send failed".to_string())))
    }
}

#[derive(Debug)]
struct PoisonInfo {
    job_id: Option<String>,
    detail: String,
}

/// Decode the pulled message into a Job Message, or classify it as poison.
/// A body that parses as JSON but lacks a usable `job_id` is still poison;
/// the id is recovered when present so a synthetic failure can be emitted.
fn parse_job(message: &PulledMessage) -> std::result::Result<JobMessage, PoisonInfo> {
    let Some(body) = &message.body else {
        return Err(PoisonInfo {
            job_id: None,
            detail: message
                .decode_error
                .clone()
                .unwrap_or_else(|| "message body missing".to_string()),
        });
    };

    match serde_json::from_value::<JobMessage>(body.clone()) {
        Ok(job) if !job.job_id.is_empty() => Ok(job),
        Ok(_) => Err(PoisonInfo { job_id: None, detail: "empty job_id".to_string() }),
        Err(err) => Err(PoisonInfo {
            job_id: body.get("job_id").and_then(serde_json::Value::as_str).map(String::from),
            detail: format!("job message does not parse: {err}"),
        }),
    }
}

/// Publisher task: forwards running/heartbeat events to the results queue.
/// Failures here never affect job state; they are logged and dropped.
async fn publish_events(
    queue: Arc<QueueClient>,
    mut rx: mpsc::UnboundedReceiver<ResultEvent>,
) {
    while let Some(event) = rx.recv().await {
        let body = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "Unserialisable result event");
                continue;
            }
        };
        if let Err(err) = queue.send(Queue::Results, &body).await {
            tracing::warn!(status = event.status(), error = %err, "Dropping result event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pulled(body: Option<serde_json::Value>, decode_error: Option<&str>) -> PulledMessage {
        PulledMessage {
            lease_id: "lease-1".to_string(),
            attempts: 1,
            body,
            decode_error: decode_error.map(String::from),
        }
    }

    #[test]
    fn visibility_is_clamped_to_service_maximum() {
        assert_eq!(pull_visibility(), Duration::from_secs(43_200));
    }

    #[test]
    fn parse_job_accepts_wellformed_message() {
        let body = json!({"job_id": "umbral-otter-0a1b2c", "input": {"command": "true"}});
        let job = parse_job(&pulled(Some(body), None)).unwrap();
        assert_eq!(job.job_id, "umbral-otter-0a1b2c");
    }

    #[test]
    fn parse_job_flags_missing_body_as_poison() {
        let err = parse_job(&pulled(None, Some("bad base64"))).unwrap_err();
        assert!(err.job_id.is_none());
        assert_eq!(err.detail, "bad base64");
    }

    #[test]
    fn parse_job_recovers_id_from_malformed_message() {
        // job_id present but created_at is garbage, so typed parse fails.
        let body = json!({"job_id": "solar-wren-ffffff", "created_at": 12});
        let err = parse_job(&pulled(Some(body), None)).unwrap_err();
        assert_eq!(err.job_id.as_deref(), Some("solar-wren-ffffff"));
    }
}
