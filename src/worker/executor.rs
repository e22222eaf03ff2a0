//! Job execution: workspace setup, container/host process lifecycle,
//! stdout/stderr tee with rolling tails, timeout enforcement and the
//! `done.json` idempotence marker.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{HpcqError, Result};
use crate::job::{ErrorKind, ExecMode, JobInput, JobMessage, ResultEvent, StagedFile};
use crate::layout::{atomic_write_json, Layout};

/// Rolling tail size carried in running and terminal events.
pub const TAIL_BYTES: usize = 4096;
/// Cadence of `running` tail events while a job executes.
pub const RUNNING_EVENT_INTERVAL: Duration = Duration::from_secs(10);
/// Grace between SIGTERM and SIGKILL on timeout or shutdown.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Rolling capture of one output stream: full bytes go to the on-disk log,
/// the last [`TAIL_BYTES`] stay in memory, and the absolute counter backs
/// the consumer-side dedup.
#[derive(Debug, Default)]
struct TailBuffer {
    tail: Vec<u8>,
    total_bytes: u64,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > TAIL_BYTES {
            let cut = self.tail.len() - TAIL_BYTES;
            self.tail.drain(..cut);
        }
    }

    /// UTF-8-safe snapshot: steps forward past any partial leading
    /// code point left by the byte-oriented trim.
    fn snapshot(&self) -> String {
        match std::str::from_utf8(&self.tail) {
            Ok(s) => s.to_string(),
            Err(_) => {
                let mut start = 0;
                while start < self.tail.len() && start < 4 {
                    if let Ok(s) = std::str::from_utf8(&self.tail[start..]) {
                        return s.to_string();
                    }
                    start += 1;
                }
                String::from_utf8_lossy(&self.tail).into_owned()
            }
        }
    }
}

pub struct JobExecutor {
    config: Arc<Config>,
    layout: Layout,
}

impl JobExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        let layout = Layout::new(&config);
        Self { config, layout }
    }

    /// Run one job to its terminal event. All failure modes fold into a
    /// `failed` event; the caller decides ack/no-ack from the error kind.
    ///
    /// Redelivered jobs short-circuit on the `done.json` marker and re-emit
    /// the recorded terminal event verbatim.
    pub async fn execute(
        &self,
        job: &JobMessage,
        events: &mpsc::UnboundedSender<ResultEvent>,
        cancel: &CancellationToken,
    ) -> ResultEvent {
        if let Some(prior) = self.read_done_marker(&job.job_id) {
            tracing::info!(job_id = %job.job_id, "Replaying terminal event from done marker");
            return prior;
        }

        let started = Instant::now();
        let terminal = match self.run_job(job, events, cancel, started).await {
            Ok(event) => event,
            Err(err) => self.failure_event(job, &err, started),
        };

        if let Err(err) = self.write_done_marker(&job.job_id, &terminal) {
            // The job already ran; a marker failure only weakens redelivery
            // dedup, so log and carry on.
            tracing::warn!(job_id = %job.job_id, error = %err, "Failed to write done marker");
        }
        terminal
    }

    fn read_done_marker(&self, job_id: &str) -> Option<ResultEvent> {
        let raw = std::fs::read_to_string(self.layout.done_marker(job_id)).ok()?;
        match serde_json::from_str::<ResultEvent>(&raw) {
            Ok(event) if event.is_terminal() => Some(event),
            _ => None,
        }
    }

    fn write_done_marker(&self, job_id: &str, event: &ResultEvent) -> Result<()> {
        // Shutdown interruptions are not terminal for the job: the message
        // redelivers and the next attempt must actually run.
        if let ResultEvent::Failed { error_kind: ErrorKind::WorkerShutdown, .. } = event {
            return Ok(());
        }
        atomic_write_json(&self.layout.done_marker(job_id), event)
    }

    fn failure_event(&self, job: &JobMessage, err: &HpcqError, started: Instant) -> ResultEvent {
        let error_kind = match err {
            HpcqError::InvalidInput(_) => ErrorKind::InvalidInput,
            HpcqError::LaunchFailed(_) => ErrorKind::LaunchFailed,
            HpcqError::ImageUnavailable(_) | HpcqError::ImageRefresh(_) => ErrorKind::ImageUnavailable,
            _ => ErrorKind::LaunchFailed,
        };
        ResultEvent::Failed {
            job_id: job.job_id.clone(),
            exit_code: None,
            error_kind,
            error_detail: err.to_string(),
            duration_seconds: started.elapsed().as_secs_f64(),
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            timestamp: Utc::now(),
        }
    }

    async fn run_job(
        &self,
        job: &JobMessage,
        events: &mpsc::UnboundedSender<ResultEvent>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ResultEvent> {
        let input = JobInput(&job.input);
        let job_dir = self.layout.job_dir(&job.job_id);
        tokio::fs::create_dir_all(&job_dir).await?;

        atomic_write_json(
            &job_dir.join("input.json"),
            &serde_json::json!({"job_id": job.job_id, "input": job.input}),
        )?;
        stage_files(&job_dir, &input.staged_files())?;

        let command_line = assemble_command(&input)?;
        let mut command = self.build_process(&input, &command_line, &job_dir);

        let stdout_log = job_dir.join("stdout.log");
        let stderr_log = job_dir.join("stderr.log");
        tokio::fs::File::create(&stdout_log).await?;
        tokio::fs::File::create(&stderr_log).await?;

        tracing::info!(
            job_id = %job.job_id,
            exec_mode = %input.exec_mode(),
            command = %command_line,
            "Launching job"
        );

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HpcqError::LaunchFailed(e.to_string()))?;

        let stdout_buf = Arc::new(Mutex::new(TailBuffer::default()));
        let stderr_buf = Arc::new(Mutex::new(TailBuffer::default()));

        let stdout_reader = spawn_stream_reader(
            child.stdout.take().ok_or_else(|| HpcqError::LaunchFailed("no stdout pipe".into()))?,
            stdout_log.clone(),
            stdout_buf.clone(),
        );
        let stderr_reader = spawn_stream_reader(
            child.stderr.take().ok_or_else(|| HpcqError::LaunchFailed("no stderr pipe".into()))?,
            stderr_log.clone(),
            stderr_buf.clone(),
        );

        let timeout = Duration::from_secs(input.timeout_seconds());
        let outcome = self
            .supervise_child(&mut child, job, events, cancel, timeout, &stdout_buf, &stderr_buf)
            .await;

        // Drain the pipes before snapshotting the final tails. The readers
        // end when the descriptors close; an orphaned grandchild can hold
        // them open, so the wait is bounded.
        let drain = Duration::from_secs(5);
        let _ = tokio::time::timeout(drain, stdout_reader).await;
        let _ = tokio::time::timeout(drain, stderr_reader).await;

        let stdout_tail = stdout_buf.lock().await.snapshot();
        let stderr_tail = stderr_buf.lock().await.snapshot();
        let duration_seconds = started.elapsed().as_secs_f64();

        let event = match outcome {
            ChildOutcome::Exited(code) if code == 0 => ResultEvent::Completed {
                job_id: job.job_id.clone(),
                exit_code: 0,
                duration_seconds,
                stdout_tail,
                stderr_tail,
                result_pointer: result_pointer(&job_dir),
                timestamp: Utc::now(),
            },
            ChildOutcome::Exited(code) => ResultEvent::Failed {
                job_id: job.job_id.clone(),
                exit_code: Some(code),
                error_kind: ErrorKind::NonzeroExit,
                error_detail: format!("process exited with code {code}"),
                duration_seconds,
                stdout_tail,
                stderr_tail,
                timestamp: Utc::now(),
            },
            ChildOutcome::Signaled => ResultEvent::Failed {
                job_id: job.job_id.clone(),
                exit_code: None,
                error_kind: ErrorKind::NonzeroExit,
                error_detail: "process terminated by signal".to_string(),
                duration_seconds,
                stdout_tail,
                stderr_tail,
                timestamp: Utc::now(),
            },
            ChildOutcome::TimedOut => ResultEvent::Failed {
                job_id: job.job_id.clone(),
                exit_code: None,
                error_kind: ErrorKind::Timeout,
                error_detail: format!("wall clock exceeded {}s", timeout.as_secs()),
                duration_seconds,
                stdout_tail,
                stderr_tail,
                timestamp: Utc::now(),
            },
            ChildOutcome::Shutdown => ResultEvent::Failed {
                job_id: job.job_id.clone(),
                exit_code: None,
                error_kind: ErrorKind::WorkerShutdown,
                error_detail: "worker received shutdown signal during execution".to_string(),
                duration_seconds,
                stdout_tail,
                stderr_tail,
                timestamp: Utc::now(),
            },
        };
        Ok(event)
    }

    fn build_process(&self, input: &JobInput<'_>, command_line: &str, job_dir: &Path) -> Command {
        match input.exec_mode() {
            ExecMode::Host => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(command_line).current_dir(job_dir);
                cmd
            }
            ExecMode::Container => {
                let mut cmd = Command::new(&self.config.apptainer_bin);
                cmd.current_dir(job_dir);
                cmd.arg("exec")
                    .arg("--pwd")
                    .arg("/work")
                    .arg("--bind")
                    .arg(format!("{}:/work", job_dir.display()));
                for bind in &self.config.extra_binds {
                    cmd.arg("--bind").arg(bind);
                }
                cmd.arg(&self.config.apptainer_image)
                    .arg("/bin/sh")
                    .arg("-c")
                    .arg(command_line);
                cmd
            }
        }
    }

    /// Wait for the child while ticking `running` events; returns how the
    /// wait ended. Timeout and shutdown both terminate gracefully first and
    /// hard-kill after [`KILL_GRACE`].
    #[allow(clippy::too_many_arguments)]
    async fn supervise_child(
        &self,
        child: &mut tokio::process::Child,
        job: &JobMessage,
        events: &mpsc::UnboundedSender<ResultEvent>,
        cancel: &CancellationToken,
        timeout: Duration,
        stdout_buf: &Arc<Mutex<TailBuffer>>,
        stderr_buf: &Arc<Mutex<TailBuffer>>,
    ) -> ChildOutcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(RUNNING_EVENT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick carries no news

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(s) => match s.code() {
                            Some(code) => ChildOutcome::Exited(code),
                            None => ChildOutcome::Signaled,
                        },
                        Err(e) => {
                            tracing::error!(job_id = %job.job_id, error = %e, "Failed to reap child");
                            ChildOutcome::Signaled
                        }
                    };
                }
                _ = &mut deadline => {
                    tracing::warn!(job_id = %job.job_id, timeout_s = timeout.as_secs(), "Job hit wall-clock timeout");
                    terminate_child(child).await;
                    return ChildOutcome::TimedOut;
                }
                _ = cancel.cancelled() => {
                    tracing::warn!(job_id = %job.job_id, "Shutdown requested, terminating job");
                    terminate_child(child).await;
                    return ChildOutcome::Shutdown;
                }
                _ = ticker.tick() => {
                    let (stdout_tail, bytes_read_stdout) = {
                        let buf = stdout_buf.lock().await;
                        (buf.snapshot(), buf.total_bytes)
                    };
                    let (stderr_tail, bytes_read_stderr) = {
                        let buf = stderr_buf.lock().await;
                        (buf.snapshot(), buf.total_bytes)
                    };
                    let event = ResultEvent::Running {
                        job_id: job.job_id.clone(),
                        stdout_tail,
                        stderr_tail,
                        bytes_read_stdout,
                        bytes_read_stderr,
                        timestamp: Utc::now(),
                    };
                    if events.send(event).is_err() {
                        tracing::debug!(job_id = %job.job_id, "Event channel closed, stopping tail emission");
                    }
                }
            }
        }
    }
}

enum ChildOutcome {
    Exited(i32),
    Signaled,
    TimedOut,
    Shutdown,
}

/// SIGTERM, wait out the grace period, then SIGKILL if still alive.
async fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "Child ignored SIGTERM, sending SIGKILL");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn spawn_stream_reader<R>(
    mut stream: R,
    log_path: PathBuf,
    buffer: Arc<Mutex<TailBuffer>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut file = match tokio::fs::OpenOptions::new().append(true).open(&log_path).await {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(path = %log_path.display(), error = %e, "Cannot open log for tee");
                return;
            }
        };
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = file.write_all(&chunk[..n]).await {
                        tracing::error!(path = %log_path.display(), error = %e, "Log write failed");
                        break;
                    }
                    buffer.lock().await.push(&chunk[..n]);
                }
                Err(e) => {
                    tracing::debug!(path = %log_path.display(), error = %e, "Stream read ended");
                    break;
                }
            }
        }
        let _ = file.flush().await;
    })
}

/// Workspace path of `output.json` if the job produced one.
fn result_pointer(job_dir: &Path) -> Option<String> {
    let path = job_dir.join("output.json");
    path.exists().then(|| path.display().to_string())
}

/// Build the shell command for the job. Explicit `command` wins; run-file
/// jobs assemble `<runner> <staged-path> [args…]` with shell quoting, and an
/// empty runner execs the staged file directly.
fn assemble_command(input: &JobInput<'_>) -> Result<String> {
    let explicit = input.command();
    if !explicit.is_empty() {
        return Ok(explicit.to_string());
    }

    let file_name = input
        .file_name()
        .ok_or_else(|| HpcqError::InvalidInput("job has neither command nor file_name".to_string()))?;

    let mut parts: Vec<String> = Vec::new();
    match input.runner() {
        Some("") => {}
        Some(runner) => parts.push(shell_quote(runner)),
        None => parts.push("python".to_string()),
    }
    parts.push(shell_quote(file_name));
    if let Some(args) = input.0.get("file_args").and_then(serde_json::Value::as_array) {
        for arg in args {
            if let Some(s) = arg.as_str() {
                parts.push(shell_quote(s));
            }
        }
    }
    Ok(parts.join(" "))
}

/// POSIX single-quote escaping.
fn shell_quote(raw: &str) -> String {
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric() || "._-/=:@%+".contains(c)) {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Materialise staged files inside the workspace. Paths must stay relative
/// and inside the job dir.
fn stage_files(job_dir: &Path, files: &[StagedFile]) -> Result<()> {
    for file in files {
        let rel = Path::new(&file.path);
        if rel.is_absolute()
            || rel.components().any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(HpcqError::InvalidInput(format!("staged file escapes workspace: {}", file.path)));
        }
        let data = BASE64
            .decode(file.content_b64.as_bytes())
            .map_err(|e| HpcqError::InvalidInput(format!("staged file {} has invalid base64: {e}", file.path)))?;

        let target = job_dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = u32::from_str_radix(&file.mode, 8).unwrap_or(0o644);
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}
