use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hpcq::config::Config;
use hpcq::error::{HpcqError, Result};
use hpcq::image::ImageRefresher;
use hpcq::layout::{pid_alive, read_pid_file, Layout};
use hpcq::producer::{run_producer, ProducerState};
use hpcq::queue::{Queue, QueueClient};
use hpcq::results::{load_job_logs, status_snapshot, ResultsConsumer};
use hpcq::shutdown::install_shutdown_handler;
use hpcq::supervisor::{signal_pid, Supervisor};
use hpcq::worker::ConsumerLoop;

#[derive(Parser, Debug)]
#[command(name = "hpcq")]
#[command(about = "Queue-backed job runner spanning a local machine and an HPC node")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Refresh the runtime image, then launch the supervised worker
    Start,
    /// Stop the supervisor and worker
    Stop {
        /// Also drain both queues after stopping
        #[arg(long)]
        all: bool,
    },
    /// Show worker liveness and the last remote heartbeat
    Status {
        /// Output raw JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Drain messages from the jobs and/or results queues
    Clear {
        /// Which queue(s) to clear: jobs, results or all
        target: ClearTarget,
        #[arg(long, default_value = "100")]
        batch_size: u32,
        #[arg(long, default_value = "200")]
        max_batches: u32,
    },
    /// Run the pull consumer loop in the foreground (supervisor child)
    Worker,
    /// Run the restart-on-crash supervisor in the foreground
    Supervise,
    /// Serve the job submission endpoint
    Producer {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8787")]
        addr: SocketAddr,
    },
    /// Run the local results consumer
    Results {
        /// Pull a single batch and exit
        #[arg(long)]
        once: bool,
    },
    /// Print local artefacts for one job
    Logs { job_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ClearTarget {
    Jobs,
    Results,
    All,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(args.command).await {
        tracing::error!(error = %err, "Command failed");
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(command: CliCommand) -> Result<()> {
    let config = Arc::new(Config::load()?);
    let layout = Layout::new(&config);

    match command {
        CliCommand::Start => cmd_start(&config, &layout).await,
        CliCommand::Stop { all } => cmd_stop(&config, &layout, all).await,
        CliCommand::Status { json } => cmd_status(&layout, json),
        CliCommand::Clear { target, batch_size, max_batches } => {
            cmd_clear(&config, target, batch_size, max_batches).await
        }
        CliCommand::Worker => {
            let cancel = install_shutdown_handler();
            ConsumerLoop::new(config)?.run(cancel).await
        }
        CliCommand::Supervise => {
            let cancel = install_shutdown_handler();
            Supervisor::new(&config).run(cancel).await
        }
        CliCommand::Producer { addr } => {
            let api_key = config.require_api_key()?.to_string();
            let state = ProducerState {
                api_key: Arc::new(api_key),
                queue: Arc::new(QueueClient::new(&config)?),
            };
            run_producer(addr, state).await
        }
        CliCommand::Results { once } => {
            let mut consumer = ResultsConsumer::new(config)?;
            if once {
                let handled = consumer.process_once().await?;
                println!("processed {handled} result messages");
                Ok(())
            } else {
                let cancel = install_shutdown_handler();
                consumer.run(cancel).await
            }
        }
        CliCommand::Logs { job_id } => cmd_logs(&layout, &job_id),
    }
}

/// Blocking image refresh, then hand off to a detached supervisor process.
async fn cmd_start(config: &Arc<Config>, layout: &Layout) -> Result<()> {
    if let Some(pid) = read_pid_file(&layout.supervisor_pid_file()) {
        if pid_alive(pid) {
            println!("already running (supervisor pid {pid})");
            return Ok(());
        }
    }

    if config.apptainer_oci_ref.is_some() || config.apptainer_sif_url.is_some() {
        let refresher = ImageRefresher::new(config)?;
        let outcome = refresher.ensure_fresh().await?;
        tracing::info!(outcome = ?outcome, "Runtime image ready");
    }

    std::fs::create_dir_all(layout.state_dir())?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(layout.supervisor_log_file())?;
    let log_err = log.try_clone()?;

    // std Command so the child survives this process exiting.
    let child = std::process::Command::new(std::env::current_exe()?)
        .arg("supervise")
        .stdout(log)
        .stderr(log_err)
        .spawn()
        .map_err(|e| HpcqError::Supervisor(format!("failed to launch supervisor: {e}")))?;

    println!("worker started (supervisor pid {})", child.id());
    println!("log file: {}", layout.supervisor_log_file().display());
    Ok(())
}

async fn cmd_stop(config: &Arc<Config>, layout: &Layout, all: bool) -> Result<()> {
    for (label, path) in [
        ("supervisor", layout.supervisor_pid_file()),
        ("worker", layout.worker_pid_file()),
    ] {
        if let Some(pid) = read_pid_file(&path) {
            if pid_alive(pid) && signal_pid(pid) {
                println!("sent SIGTERM to {label} (pid {pid})");
            }
        }
    }

    if all {
        let client = QueueClient::new(config)?;
        let jobs = client.drain(Queue::Jobs, 100, 200).await?;
        let results = client.drain(Queue::Results, 100, 200).await?;
        println!("cleared {jobs} job messages, {results} result messages");
    }
    Ok(())
}

fn cmd_status(layout: &Layout, json: bool) -> Result<()> {
    let snapshot = status_snapshot(layout);
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    match (snapshot.supervisor_running, snapshot.supervisor_pid) {
        (true, Some(pid)) => match snapshot.worker_pid {
            Some(wpid) => println!("worker daemon: running (supervisor pid {pid}, worker pid {wpid})"),
            None => println!("worker daemon: restarting worker (supervisor pid {pid})"),
        },
        _ => println!("worker daemon: not running"),
    }

    match (snapshot.hpc_running_remote, snapshot.hpc_heartbeat_age_seconds) {
        (Some(true), Some(age)) => println!("remote heartbeat: healthy ({age:.0}s ago)"),
        (Some(true), None) => println!("remote heartbeat: healthy (local worker)"),
        (Some(false), Some(age)) => println!("remote heartbeat: stale ({age:.0}s ago)"),
        _ => println!("remote heartbeat: unknown (none received yet)"),
    }
    Ok(())
}

async fn cmd_clear(
    config: &Arc<Config>,
    target: ClearTarget,
    batch_size: u32,
    max_batches: u32,
) -> Result<()> {
    let client = QueueClient::new(config)?;
    let mut total = 0u64;
    if matches!(target, ClearTarget::Jobs | ClearTarget::All) {
        let cleared = client.drain(Queue::Jobs, batch_size, max_batches).await?;
        println!("jobs queue: cleared {cleared}");
        total += cleared;
    }
    if matches!(target, ClearTarget::Results | ClearTarget::All) {
        let cleared = client.drain(Queue::Results, batch_size, max_batches).await?;
        println!("results queue: cleared {cleared}");
        total += cleared;
    }
    println!("total cleared: {total}");
    Ok(())
}

fn cmd_logs(layout: &Layout, job_id: &str) -> Result<()> {
    let Some(logs) = load_job_logs(layout, job_id) else {
        return Err(HpcqError::InvalidConfig(format!(
            "no local results for job {job_id}; run `hpcq results` first"
        )));
    };

    if let Some(record) = &logs.record {
        println!("{}", serde_json::to_string_pretty(record)?);
    }
    println!("source: {}", logs.source);
    println!("\n=== stdout ===");
    print!("{}", logs.stdout);
    println!("\n=== stderr ===");
    print!("{}", logs.stderr);
    println!();
    Ok(())
}
