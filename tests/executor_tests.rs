//! Executor integration tests: real child processes, real workspaces, the
//! stub container runtime where a container is involved.


use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hpcq::job::{ErrorKind, JobMessage, ResultEvent};
use hpcq::worker::JobExecutor;
use test_harness::{spawn_mock_queue, test_config, write_stub_runtime};

struct ExecutorFixture {
    executor: JobExecutor,
    events: mpsc::UnboundedReceiver<ResultEvent>,
    events_tx: mpsc::UnboundedSender<ResultEvent>,
    cancel: CancellationToken,
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
}

async fn fixture() -> ExecutorFixture {
    let (_state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let mut config = test_config(addr, &root);
    let stub = write_stub_runtime(&root);
    config.apptainer_bin = stub.display().to_string();
    std::fs::create_dir_all(root.join("runtime")).unwrap();
    std::fs::write(&config.apptainer_image, "fake-sif").unwrap();

    let (events_tx, events) = mpsc::unbounded_channel();
    ExecutorFixture {
        executor: JobExecutor::new(Arc::new(config)),
        events,
        events_tx,
        cancel: CancellationToken::new(),
        _dir: dir,
        root,
    }
}

fn job(id: &str, input: serde_json::Value) -> JobMessage {
    JobMessage {
        job_id: id.to_string(),
        input,
        created_at: None,
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn host_echo_completes_with_stdout_tail() {
    let mut f = fixture().await;
    let job = job(
        "vernal-heron-000001",
        json!({"exec_mode": "host", "command": "echo endpoint-ok"}),
    );

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Completed { exit_code, stdout_tail, result_pointer, .. } => {
            assert_eq!(exit_code, 0);
            assert_eq!(stdout_tail, "endpoint-ok\n");
            assert!(result_pointer.is_none(), "no output.json was produced");
        }
        other => panic!("expected completed, got {other:?}"),
    }

    let workspace = f.root.join("results").join("vernal-heron-000001");
    assert_eq!(
        std::fs::read_to_string(workspace.join("stdout.log")).unwrap(),
        "endpoint-ok\n"
    );
    assert!(workspace.join("input.json").exists());
    assert!(workspace.join("done.json").exists());
    assert!(f.events.try_recv().is_err(), "short job should emit no running events");
}

#[tokio::test]
async fn container_failing_command_reports_nonzero_exit() {
    let f = fixture().await;
    let job = job("barred-lynx-000002", json!({"exec_mode": "container", "command": "false"}));

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Failed { exit_code, error_kind, .. } => {
            assert_eq!(exit_code, Some(1));
            assert_eq!(error_kind, ErrorKind::NonzeroExit);
        }
        other => panic!("expected failed, got {other:?}"),
    }
}

#[tokio::test]
async fn container_invocation_binds_workspace() {
    let f = fixture().await;
    let job = job("photic-krill-000003", json!({"command": "echo in-container"}));

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;
    assert!(matches!(terminal, ResultEvent::Completed { .. }));

    let stub = f.root.join("apptainer-stub");
    let calls = test_harness::runtime_calls(&stub);
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert!(call.starts_with("exec"), "unexpected runtime call: {call}");
    assert!(call.contains("--pwd /work"), "missing workdir flag: {call}");
    assert!(
        call.contains(&format!(
            "{}:/work",
            f.root.join("results/photic-krill-000003").display()
        )),
        "missing workspace bind: {call}"
    );
}

#[tokio::test]
async fn timeout_kills_job_and_reports_duration() {
    let f = fixture().await;
    let job = job(
        "tidal-marten-000004",
        json!({"exec_mode": "host", "command": "sleep 30", "timeout_seconds": 2}),
    );

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Failed { error_kind, duration_seconds, .. } => {
            assert_eq!(error_kind, ErrorKind::Timeout);
            assert!((2.0..8.0).contains(&duration_seconds), "duration {duration_seconds}");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
}

#[tokio::test]
async fn staged_file_runs_with_runner() {
    let f = fixture().await;
    let job = job(
        "gibbous-finch-000005",
        json!({
            "runner": "bash",
            "file_name": "job.sh",
            "file_content_b64": BASE64.encode("echo 42"),
        }),
    );

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Completed { stdout_tail, .. } => assert_eq!(stdout_tail, "42\n"),
        other => panic!("expected completed, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_command_fails_as_invalid_input() {
    let f = fixture().await;
    let job = job("axial-gyre-000006", json!({"exec_mode": "host"}));

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Failed { error_kind, exit_code, .. } => {
            assert_eq!(error_kind, ErrorKind::InvalidInput);
            assert_eq!(exit_code, None);
        }
        other => panic!("expected failed, got {other:?}"),
    }
}

#[tokio::test]
async fn redelivery_replays_terminal_event_verbatim() {
    let f = fixture().await;
    let job = job(
        "mossy-comet-000007",
        json!({"exec_mode": "host", "command": "echo once >> marker.txt && cat marker.txt"}),
    );

    let first = f.executor.execute(&job, &f.events_tx, &f.cancel).await;
    let second = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    // Bit-equal replay, including the original timestamp.
    assert_eq!(first, second);

    // The command really ran only once.
    let marker = f.root.join("results/mossy-comet-000007/marker.txt");
    assert_eq!(std::fs::read_to_string(marker).unwrap(), "once\n");
}

#[tokio::test]
async fn shutdown_mid_job_yields_worker_shutdown_without_done_marker() {
    let f = fixture().await;
    let job = job(
        "polar-macaque-000008",
        json!({"exec_mode": "host", "command": "sleep 30"}),
    );

    let cancel = f.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Failed { error_kind, .. } => assert_eq!(error_kind, ErrorKind::WorkerShutdown),
        other => panic!("expected shutdown failure, got {other:?}"),
    }
    // No marker: the next delivery must actually run the job.
    assert!(!f.root.join("results/polar-macaque-000008/done.json").exists());
}

#[tokio::test]
async fn output_json_becomes_result_pointer() {
    let f = fixture().await;
    let job = job(
        "keeled-osprey-000009",
        json!({"exec_mode": "host", "command": "echo '{\"answer\":42}' > output.json"}),
    );

    let terminal = f.executor.execute(&job, &f.events_tx, &f.cancel).await;

    match terminal {
        ResultEvent::Completed { result_pointer, .. } => {
            let pointer = result_pointer.expect("output.json should be pointed at");
            assert!(pointer.ends_with("output.json"));
            assert!(std::path::Path::new(&pointer).exists());
        }
        other => panic!("expected completed, got {other:?}"),
    }
}
