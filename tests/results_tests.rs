//! Local results consumer tests: artefact writes, tail dedup across
//! running/terminal events, the heartbeat snapshot and the logs fallback.


use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use hpcq::layout::Layout;
use hpcq::results::{load_job_logs, status_snapshot, ResultsConsumer};
use test_harness::{spawn_mock_queue, test_config, RESULTS_QUEUE};

fn completed_event(job_id: &str, stdout_tail: &str) -> Value {
    json!({
        "status": "completed",
        "job_id": job_id,
        "exit_code": 0,
        "duration_seconds": 0.1,
        "stdout_tail": stdout_tail,
        "stderr_tail": "",
        "result_pointer": null,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[tokio::test]
async fn terminal_event_writes_local_artefacts_and_acks() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(addr, dir.path()));
    let layout = Layout::new(&config);
    let mut consumer = ResultsConsumer::new(config).unwrap();

    state.push_message(RESULTS_QUEUE, completed_event("lunar-egret-200001", "endpoint-ok\n"));

    let handled = consumer.process_once().await.unwrap();
    assert_eq!(handled, 1);
    assert_eq!(state.acked(RESULTS_QUEUE).len(), 1);

    let record: Value = serde_json::from_str(
        &std::fs::read_to_string(layout.local_result_json("lunar-egret-200001")).unwrap(),
    )
    .unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["exit_code"], 0);
    assert_eq!(record["stdout_tail"], "endpoint-ok\n");

    assert_eq!(
        std::fs::read_to_string(layout.local_stdout_log("lunar-egret-200001")).unwrap(),
        "endpoint-ok\n"
    );
}

#[tokio::test]
async fn running_events_deduplicate_by_byte_offset() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(addr, dir.path()));
    let layout = Layout::new(&config);
    let mut consumer = ResultsConsumer::new(config).unwrap();

    let running = |tail: &str, total: u64| {
        json!({
            "status": "running",
            "job_id": "fossil-dipper-200002",
            "stdout_tail": tail,
            "stderr_tail": "",
            "bytes_read_stdout": total,
            "bytes_read_stderr": 0,
            "timestamp": Utc::now().to_rfc3339(),
        })
    };

    state.push_message(RESULTS_QUEUE, running("alpha\n", 6));
    // Duplicate delivery of the same event, then a later tail.
    state.push_message(RESULTS_QUEUE, running("alpha\n", 6));
    state.push_message(RESULTS_QUEUE, running("alpha\nbeta\n", 11));
    consumer.process_once().await.unwrap();

    // Terminal tail overlaps everything already appended.
    state.push_message(RESULTS_QUEUE, completed_event("fossil-dipper-200002", "alpha\nbeta\n"));
    consumer.process_once().await.unwrap();

    assert_eq!(
        std::fs::read_to_string(layout.local_stdout_log("fossil-dipper-200002")).unwrap(),
        "alpha\nbeta\n"
    );
}

#[tokio::test]
async fn duplicate_terminal_delivery_is_idempotent() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(addr, dir.path()));
    let layout = Layout::new(&config);
    let mut consumer = ResultsConsumer::new(config).unwrap();

    let event = completed_event("ovate-magpie-200003", "same\n");
    state.push_message(RESULTS_QUEUE, event.clone());
    consumer.process_once().await.unwrap();
    let first = std::fs::read_to_string(layout.local_result_json("ovate-magpie-200003")).unwrap();

    state.push_message(RESULTS_QUEUE, event);
    consumer.process_once().await.unwrap();
    let second = std::fs::read_to_string(layout.local_result_json("ovate-magpie-200003")).unwrap();

    assert_eq!(first, second);
    assert_eq!(
        std::fs::read_to_string(layout.local_stdout_log("ovate-magpie-200003")).unwrap(),
        "same\n"
    );
}

#[tokio::test]
async fn heartbeat_updates_status_snapshot() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(addr, dir.path()));
    let layout = Layout::new(&config);
    let mut consumer = ResultsConsumer::new(config).unwrap();

    state.push_message(
        RESULTS_QUEUE,
        json!({
            "status": "heartbeat",
            "job_id": null,
            "hpc_running_remote": true,
            "hostname": "hpc-node-7",
            "timestamp": Utc::now().to_rfc3339(),
            "worker_version": "0.3.0",
        }),
    );
    consumer.process_once().await.unwrap();

    let snapshot = status_snapshot(&layout);
    assert_eq!(snapshot.hpc_running_remote, Some(true));
    let age = snapshot.hpc_heartbeat_age_seconds.unwrap();
    assert!(age < 5.0, "fresh heartbeat, got age {age}");
    let hb = snapshot.hpc_last_heartbeat.unwrap();
    assert_eq!(hb["hostname"], "hpc-node-7");
}

#[tokio::test]
async fn stale_heartbeat_reports_not_running() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(addr, dir.path()));
    let layout = Layout::new(&config);
    let mut consumer = ResultsConsumer::new(config).unwrap();

    let old = Utc::now() - chrono::Duration::seconds(600);
    state.push_message(
        RESULTS_QUEUE,
        json!({
            "status": "heartbeat",
            "job_id": null,
            "hpc_running_remote": true,
            "hostname": "hpc-node-7",
            "timestamp": old.to_rfc3339(),
            "worker_version": "0.3.0",
        }),
    );
    consumer.process_once().await.unwrap();

    let snapshot = status_snapshot(&layout);
    assert_eq!(snapshot.hpc_running_remote, Some(false));
}

#[tokio::test]
async fn logs_fall_back_to_cached_events() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(addr, dir.path()));
    let layout = Layout::new(&config);
    let mut consumer = ResultsConsumer::new(config).unwrap();

    // Only a running event arrives; no terminal record exists yet.
    state.push_message(
        RESULTS_QUEUE,
        json!({
            "status": "running",
            "job_id": "raptorial-newt-200004",
            "stdout_tail": "halfway there\n",
            "stderr_tail": "",
            "bytes_read_stdout": 14,
            "bytes_read_stderr": 0,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    );
    consumer.process_once().await.unwrap();

    // Remove the tail files so only the cache can answer.
    let _ = std::fs::remove_file(layout.local_stdout_log("raptorial-newt-200004"));
    let _ = std::fs::remove_file(layout.local_stderr_log("raptorial-newt-200004"));

    let logs = load_job_logs(&layout, "raptorial-newt-200004").expect("cache fallback");
    assert_eq!(logs.source, "results-cache");
    assert_eq!(logs.stdout, "halfway there\n");

    assert!(load_job_logs(&layout, "never-seen-ffffff").is_none());
}
