//! Restart-on-crash wrapper around the pull consumer.
//!
//! Runs `hpcq worker` as a child, restarting it whenever it exits. Crashes
//! (non-zero exits) restart with exponential backoff; clean exits restart
//! immediately, which is how the drain/reload protocol swaps in new code.
//! On SIGTERM/SIGINT the signal is forwarded to the child, with a hard kill
//! after ten seconds.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{HpcqError, Result};
use crate::layout::{write_pid_file, Layout};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Uptime after which a crash is considered fresh and backoff resets.
const BACKOFF_RESET_UPTIME: Duration = Duration::from_secs(300);
const SHUTDOWN_HARD_KILL: Duration = Duration::from_secs(10);

pub struct Supervisor {
    layout: Layout,
}

impl Supervisor {
    pub fn new(config: &Arc<Config>) -> Self {
        Self { layout: Layout::new(config) }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(self.layout.state_dir())?;
        write_pid_file(&self.layout.supervisor_pid_file())?;

        let mut backoff = BACKOFF_INITIAL;
        let exit = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let started = Instant::now();
            let mut child = match self.spawn_worker() {
                Ok(child) => child,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to spawn worker");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break Ok(()),
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            };
            tracing::info!(pid = child.id(), "Worker started");

            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    self.shutdown_child(&mut child).await;
                    break Ok(());
                }
            };

            let uptime = started.elapsed();
            match status {
                Ok(status) if status.success() => {
                    tracing::info!("Worker exited cleanly, restarting");
                    backoff = BACKOFF_INITIAL;
                }
                Ok(status) => {
                    if uptime >= BACKOFF_RESET_UPTIME {
                        backoff = BACKOFF_INITIAL;
                    }
                    tracing::warn!(
                        code = ?status.code(),
                        uptime_s = uptime.as_secs(),
                        backoff_s = backoff.as_secs(),
                        "Worker crashed, restarting after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => break Ok(()),
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Err(err) => {
                    break Err(HpcqError::Supervisor(format!("failed to wait for worker: {err}")));
                }
            }
        };

        let _ = std::fs::remove_file(self.layout.supervisor_pid_file());
        let _ = std::fs::remove_file(self.layout.worker_pid_file());
        exit
    }

    fn spawn_worker(&self) -> Result<Child> {
        let exe = std::env::current_exe()?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.supervisor_log_file())?;
        let log_err = log.try_clone()?;

        Command::new(exe)
            .arg("worker")
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| HpcqError::Supervisor(format!("spawn failed: {e}")))
    }

    /// Forward SIGTERM and give the worker time to drain its in-flight job
    /// bookkeeping; SIGKILL if it is still around after the grace window.
    async fn shutdown_child(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            tracing::info!(pid, "Forwarding shutdown signal to worker");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(SHUTDOWN_HARD_KILL, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "Worker ignored SIGTERM, killing");
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Send SIGTERM to a previously recorded pid, used by `stop`.
pub fn signal_pid(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}
