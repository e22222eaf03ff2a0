//! Queue client behavior against the mock queue service: body decoding,
//! batch ack/retry bookkeeping and 429 backoff pacing.


use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;

use hpcq::queue::{Queue, QueueClient};
use test_harness::{spawn_mock_queue, test_config, JOBS_QUEUE, RESULTS_QUEUE};

#[tokio::test]
async fn pull_decodes_base64_wrapped_json() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    state.push_message(JOBS_QUEUE, json!({"job_id": "umbral-otter-0a1b2c", "input": {}}));

    let messages = client.pull(Queue::Jobs, 10, Duration::from_secs(60)).await.unwrap();
    assert_eq!(messages.len(), 1);
    let body = messages[0].body.as_ref().expect("body should decode");
    assert_eq!(body["job_id"], "umbral-otter-0a1b2c");
    assert!(messages[0].decode_error.is_none());
}

#[tokio::test]
async fn pull_surfaces_undecodable_body_as_poison() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    state.push_message(JOBS_QUEUE, json!("%%definitely-not-json%%"));

    let messages = client.pull(Queue::Jobs, 1, Duration::from_secs(60)).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].body.is_none());
    assert!(messages[0].decode_error.is_some());
    // The lease is still usable, so the poison can be acked away.
    assert!(!messages[0].lease_id.is_empty());
}

#[tokio::test]
async fn ack_and_retry_are_recorded_per_lease() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    state.push_message(JOBS_QUEUE, json!({"job_id": "a"}));
    state.push_message(JOBS_QUEUE, json!({"job_id": "b"}));
    let messages = client.pull(Queue::Jobs, 2, Duration::from_secs(60)).await.unwrap();
    let leases: Vec<String> = messages.iter().map(|m| m.lease_id.clone()).collect();

    client.ack(Queue::Jobs, &leases[..1]).await.unwrap();
    client.retry(Queue::Jobs, &leases[1..], Duration::from_secs(30)).await.unwrap();

    assert_eq!(state.acked(JOBS_QUEUE), vec![leases[0].clone()]);
    assert_eq!(state.retried(JOBS_QUEUE), vec![(leases[1].clone(), 30)]);
}

#[tokio::test]
async fn send_delivers_body_to_queue() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    client
        .send(Queue::Results, &json!({"status": "heartbeat", "hostname": "n1"}))
        .await
        .unwrap();

    let sent = state.sent_to(RESULTS_QUEUE);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["hostname"], "n1");
}

#[tokio::test]
async fn send_backoff_never_fires_before_the_floor() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    state.rate_limit_sends.store(2, Ordering::SeqCst);
    client.send(Queue::Results, &json!({"status": "heartbeat"})).await.unwrap();

    let attempts = state.send_attempts();
    assert_eq!(attempts.len(), 3, "two 429s then one success");
    // Retry n must wait at least 100 * 2^(n-1) ms after attempt n.
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(100));
    assert!(attempts[2] - attempts[1] >= Duration::from_millis(200));
}

#[tokio::test]
async fn send_surfaces_rate_limit_after_five_attempts() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    state.rate_limit_sends.store(u32::MAX, Ordering::SeqCst);
    let err = client
        .send(Queue::Results, &json!({"status": "heartbeat"}))
        .await
        .unwrap_err();

    assert!(matches!(err, hpcq::error::HpcqError::RateLimited { attempts: 5 }));
    assert_eq!(state.send_attempts().len(), 5);
}

#[tokio::test]
async fn send_transport_failure_is_not_retried_as_rate_limit() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    state.fail_sends.store(true, Ordering::SeqCst);
    let err = client.send(Queue::Results, &json!({"status": "heartbeat"})).await.unwrap_err();

    assert!(matches!(err, hpcq::error::HpcqError::Transport(_)));
    assert_eq!(state.send_attempts().len(), 1);
}

#[tokio::test]
async fn drain_acks_everything() {
    let (state, addr) = spawn_mock_queue().await;
    let dir = tempfile::tempdir().unwrap();
    let client = QueueClient::new(&test_config(addr, dir.path())).unwrap();

    for i in 0..7 {
        state.push_message(JOBS_QUEUE, json!({"job_id": format!("job-{i}")}));
    }

    let cleared = client.drain(Queue::Jobs, 3, 10).await.unwrap();
    assert_eq!(cleared, 7);
    assert_eq!(state.queue_len(JOBS_QUEUE), 0);
    assert_eq!(state.acked(JOBS_QUEUE).len(), 7);
}
