//! Thin HTTP adapter to the external queue service.
//!
//! Four verbs: `pull`, `ack`, `retry`, `send`. One shared `reqwest::Client`
//! keeps connections warm across polls. The service delivers at-least-once;
//! everything above this layer is built around that.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{HpcqError, Result};

pub const MAX_BATCH_SIZE: u32 = 100;
pub const MIN_VISIBILITY_SECONDS: u64 = 1;
pub const MAX_VISIBILITY_SECONDS: u64 = 43_200;

const SEND_MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 2_000;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One leased message from a pull. An undecodable body is surfaced rather
/// than dropped so the consumer can ack the poison and move on.
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub lease_id: String,
    pub attempts: u32,
    pub body: Option<Value>,
    pub decode_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    lease_id: Option<String>,
    #[serde(default)]
    attempts: u32,
    body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    errors: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    http: reqwest::Client,
    api_token: String,
    jobs_url: String,
    results_url: String,
}

/// Which of the two queues an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Jobs,
    Results,
}

impl QueueClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(HpcqError::Http)?;
        Ok(Self {
            http,
            api_token: config.api_token.clone(),
            jobs_url: config.messages_url(&config.jobs_queue_id),
            results_url: config.messages_url(&config.results_queue_id),
        })
    }

    fn base_url(&self, queue: Queue) -> &str {
        match queue {
            Queue::Jobs => &self.jobs_url,
            Queue::Results => &self.results_url,
        }
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<reqwest::Response> {
        self.http
            .post(url)
            .bearer_auth(&self.api_token)
            .json(payload)
            .send()
            .await
            .map_err(|e| HpcqError::Transport(format!("POST {url}: {e}")))
    }

    async fn post_checked(&self, url: &str, payload: &Value) -> Result<ApiEnvelope> {
        let resp = self.post(url, payload).await?;
        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(HpcqError::RateLimited { attempts: 1 });
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(HpcqError::Transport(format!("{url} returned {status}: {detail}")));
        }
        let envelope: ApiEnvelope = resp
            .json()
            .await
            .map_err(|e| HpcqError::Transport(format!("{url} bad response body: {e}")))?;
        if envelope.success == Some(false) {
            return Err(HpcqError::QueueApi(format!("{:?}", envelope.errors)));
        }
        Ok(envelope)
    }

    /// Pull up to `batch_size` messages, leasing each for `visibility`.
    pub async fn pull(
        &self,
        queue: Queue,
        batch_size: u32,
        visibility: Duration,
    ) -> Result<Vec<PulledMessage>> {
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        let visibility_secs = visibility
            .as_secs()
            .clamp(MIN_VISIBILITY_SECONDS, MAX_VISIBILITY_SECONDS);

        let url = format!("{}/pull", self.base_url(queue));
        let envelope = self
            .post_checked(
                &url,
                &json!({
                    "batch_size": batch_size,
                    "visibility_timeout_ms": visibility_secs * 1000,
                }),
            )
            .await?;

        let raw_messages: Vec<RawMessage> = match envelope.result {
            Some(Value::Object(mut map)) => map
                .remove("messages")
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default(),
            Some(Value::Array(items)) => serde_json::from_value(Value::Array(items))?,
            _ => Vec::new(),
        };

        Ok(raw_messages
            .into_iter()
            .filter_map(|raw| {
                let lease_id = raw.lease_id?;
                let (body, decode_error) = match decode_body(raw.body) {
                    Ok(value) => (Some(value), None),
                    Err(detail) => (None, Some(detail)),
                };
                Some(PulledMessage {
                    lease_id,
                    attempts: raw.attempts,
                    body,
                    decode_error,
                })
            })
            .collect())
    }

    /// Acknowledge leases. On a batch failure each lease is retried
    /// individually so one bad id cannot wedge the rest.
    pub async fn ack(&self, queue: Queue, lease_ids: &[String]) -> Result<()> {
        self.ack_retry(queue, lease_ids, &[], Duration::ZERO).await
    }

    /// Return leases to the queue after `delay`.
    pub async fn retry(&self, queue: Queue, lease_ids: &[String], delay: Duration) -> Result<()> {
        self.ack_retry(queue, &[], lease_ids, delay).await
    }

    async fn post_ack_payload(
        &self,
        queue: Queue,
        acks: &[String],
        retries: &[String],
        delay: Duration,
    ) -> Result<()> {
        let url = format!("{}/ack", self.base_url(queue));
        let payload = json!({
            "acks": acks.iter().map(|id| json!({"lease_id": id})).collect::<Vec<_>>(),
            "retries": retries
                .iter()
                .map(|id| json!({"lease_id": id, "delay_seconds": delay.as_secs()}))
                .collect::<Vec<_>>(),
        });
        self.post_checked(&url, &payload).await.map(|_| ())
    }

    async fn ack_retry(
        &self,
        queue: Queue,
        acks: &[String],
        retries: &[String],
        delay: Duration,
    ) -> Result<()> {
        if acks.is_empty() && retries.is_empty() {
            return Ok(());
        }

        match self.post_ack_payload(queue, acks, retries, delay).await {
            Ok(()) => Ok(()),
            Err(batch_err) if acks.len() + retries.len() > 1 => {
                tracing::warn!(error = %batch_err, "Batch ack failed, retrying per lease");
                let mut last_err = None;
                for id in acks {
                    if let Err(e) = self
                        .post_ack_payload(queue, std::slice::from_ref(id), &[], Duration::ZERO)
                        .await
                    {
                        last_err = Some(e);
                    }
                }
                for id in retries {
                    if let Err(e) = self
                        .post_ack_payload(queue, &[], std::slice::from_ref(id), delay)
                        .await
                    {
                        last_err = Some(e);
                    }
                }
                match last_err {
                    None => Ok(()),
                    Some(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Pull+ack until the queue stops returning messages or `max_batches`
    /// cycles have run. Returns the number of messages discarded.
    pub async fn drain(&self, queue: Queue, batch_size: u32, max_batches: u32) -> Result<u64> {
        let mut total = 0u64;
        for _ in 0..max_batches {
            let messages = self
                .pull(queue, batch_size, Duration::from_secs(120))
                .await?;
            if messages.is_empty() {
                break;
            }
            let lease_ids: Vec<String> = messages.into_iter().map(|m| m.lease_id).collect();
            total += lease_ids.len() as u64;
            self.ack(queue, &lease_ids).await?;
        }
        Ok(total)
    }

    /// Enqueue one message body. 429s back off exponentially (base 100 ms,
    /// cap 2 s) with jitter added on top of the deterministic floor, so the
    /// n-th retry never fires before `100 * 2^(n-1)` ms.
    pub async fn send(&self, queue: Queue, body: &Value) -> Result<()> {
        let url = self.base_url(queue).to_string();
        let payload = json!({ "body": body });

        let mut floor_ms = BACKOFF_BASE_MS;
        for attempt in 1..=SEND_MAX_ATTEMPTS {
            match self.post_checked(&url, &payload).await {
                Ok(_) => return Ok(()),
                Err(HpcqError::RateLimited { .. }) => {
                    if attempt == SEND_MAX_ATTEMPTS {
                        return Err(HpcqError::RateLimited { attempts: attempt });
                    }
                    let jitter_ms = rand::thread_rng().gen_range(0..=floor_ms);
                    let delay_ms = (floor_ms + jitter_ms).min(BACKOFF_CAP_MS).max(floor_ms);
                    tracing::debug!(attempt, delay_ms, "Queue send rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    floor_ms = (floor_ms * 2).min(BACKOFF_CAP_MS);
                }
                Err(other) => return Err(other),
            }
        }
        Err(HpcqError::RateLimited { attempts: SEND_MAX_ATTEMPTS })
    }
}

/// Decode a message body from the transport envelope. Pull responses may
/// carry the JSON re-encoded as base64; push-style test fixtures hand the
/// object through directly. Try base64(JSON) first, then plain JSON.
pub fn decode_body(raw: Option<Value>) -> std::result::Result<Value, String> {
    match raw {
        None => Err("message has no body".to_string()),
        Some(Value::String(text)) => {
            if let Ok(bytes) = BASE64.decode(text.as_bytes()) {
                if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                    return Ok(value);
                }
            }
            serde_json::from_str::<Value>(&text)
                .map_err(|e| format!("body is neither base64 JSON nor JSON: {e}"))
        }
        Some(value @ (Value::Object(_) | Value::Array(_))) => Ok(value),
        Some(other) => Err(format!("unsupported body type: {other}")),
    }
}
