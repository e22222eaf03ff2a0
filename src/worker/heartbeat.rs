use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::ResultEvent;

pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Emits a liveness event on a fixed cadence, independent of job activity.
///
/// `hpc_running_remote` mirrors whether a job is in flight at emission time;
/// the local side uses it (plus the event timestamp) for its status view.
pub struct HeartbeatSender {
    interval: Duration,
    hostname: String,
    job_in_flight: Arc<AtomicBool>,
}

impl HeartbeatSender {
    pub fn new(interval: Duration, job_in_flight: Arc<AtomicBool>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self { interval, hostname, job_in_flight }
    }

    pub fn event(&self) -> ResultEvent {
        ResultEvent::Heartbeat {
            job_id: None,
            hpc_running_remote: self.job_in_flight.load(Ordering::Relaxed),
            hostname: self.hostname.clone(),
            timestamp: Utc::now(),
            worker_version: WORKER_VERSION.to_string(),
        }
    }

    /// Run until cancelled, pushing heartbeats into the publisher channel.
    pub async fn run(&self, tx: mpsc::UnboundedSender<ResultEvent>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if tx.send(self.event()).is_err() {
                        // Publisher gone, nothing left to heartbeat for.
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}
