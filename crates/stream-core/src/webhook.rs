//! Signed webhook delivery: payload shape, HMAC-SHA256 signing/verification,
//! the retry schedule, and the dispatcher that POSTs to external URLs.
//!
//! Every attempt re-signs over the same fixed body bytes with a fresh
//! timestamp, and every attempt (and redirect hop) is revalidated against
//! the SSRF guard — a URL allowed when the worker started may not be
//! allowed by the time attempt 3 fires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::ssrf::validate_outbound_url;

const MAX_ATTEMPTS: u32 = 4;
const MAX_REDIRECTS: u8 = 5;
const SIGNATURE_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    StreamStarted,
    StreamEnded,
    StreamDelayed,
    StreamSuspended,
    StreamResumed,
    AlertBlackout,
    AlertBlackoutRecovered,
    AlertSilence,
    AlertSilenceRecovered,
    AlertSegmentError,
    MonitorError,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamStarted => "stream.started",
            Self::StreamEnded => "stream.ended",
            Self::StreamDelayed => "stream.delayed",
            Self::StreamSuspended => "stream.suspended",
            Self::StreamResumed => "stream.resumed",
            Self::AlertBlackout => "alert.blackout",
            Self::AlertBlackoutRecovered => "alert.blackout_recovered",
            Self::AlertSilence => "alert.silence",
            Self::AlertSilenceRecovered => "alert.silence_recovered",
            Self::AlertSegmentError => "alert.segment_error",
            Self::MonitorError => "monitor.error",
        }
    }
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: String,
    pub monitor_id: String,
    pub stream_url: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl WebhookPayload {
    pub fn new(
        event_type: WebhookEvent,
        monitor_id: impl Into<String>,
        stream_url: impl Into<String>,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            monitor_id: monitor_id.into(),
            stream_url: stream_url.into(),
            timestamp: Utc::now(),
            data,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAttemptResult {
    pub success: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `retryDelay(1)=0, retryDelay(2)=1s, retryDelay(3)=2s, retryDelay(4)=4s,
/// retryDelay(n>=5)<=10s` — `attempt` is 1-based, the attempt about to run.
pub fn retry_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let shift = (attempt - 2).min(10);
    let millis = 1000u64.saturating_mul(1u64 << shift);
    Duration::from_millis(millis.min(10_000))
}

fn hmac_hex(signing_key: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn sign_payload(signing_key: &str, timestamp: i64, body: &[u8]) -> String {
    hmac_hex(signing_key, timestamp, body)
}

pub fn webhook_headers(timestamp: i64, signature: &str) -> Vec<(&'static str, String)> {
    vec![
        ("X-Timestamp", timestamp.to_string()),
        ("X-Signature-256", format!("sha256={signature}")),
    ]
}

/// Rejects a stale timestamp outright, then constant-time-compares the
/// recomputed HMAC so verification never leaks timing information about
/// which byte of the signature was wrong.
pub fn verify_signature(
    signing_key: &str,
    signature_hex: &str,
    timestamp: i64,
    body: &[u8],
    now: DateTime<Utc>,
) -> bool {
    if (now.timestamp() - timestamp).abs() > SIGNATURE_WINDOW_SECS {
        return false;
    }
    let expected = hmac_hex(signing_key, timestamp, body);
    let (Ok(expected_bytes), Ok(given_bytes)) = (hex::decode(&expected), hex::decode(signature_hex)) else {
        return false;
    };
    expected_bytes.ct_eq(&given_bytes).into()
}

/// POSTs signed event payloads to external callback/operator URLs.
pub struct WebhookDispatcher {
    client: Client,
    allow_private: bool,
}

impl WebhookDispatcher {
    pub fn new(client: Client, allow_private: bool) -> Self {
        Self {
            client,
            allow_private,
        }
    }

    pub fn with_timeout(timeout: Duration, allow_private: bool) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build webhook HTTP client");
        Self::new(client, allow_private)
    }

    /// Delivers `payload` to `url`, signing with `signing_key`. Body bytes
    /// are fixed across retries; only the timestamp/signature headers
    /// change per attempt. Never returns `Err` for delivery failure —
    /// failure is reported in the returned result so callers can decide
    /// policy (worker self-terminate vs reconciler "log and move on").
    pub async fn deliver(
        &self,
        url: &str,
        signing_key: &str,
        payload: &WebhookPayload,
    ) -> Result<WebhookAttemptResult, DispatchError> {
        let body = serde_json::to_vec(payload)?;
        let mut last_error = None;
        let mut last_status = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            match self.attempt_once(url, signing_key, &body).await {
                Ok(status) => {
                    last_status = Some(status.as_u16());
                    if status.is_success() {
                        return Ok(WebhookAttemptResult {
                            success: true,
                            attempts: attempt,
                            status_code: Some(status.as_u16()),
                            error: None,
                        });
                    }
                    last_error = Some(format!("HTTP {status}"));
                    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        break;
                    }
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "webhook delivery attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Ok(WebhookAttemptResult {
            success: false,
            attempts: MAX_ATTEMPTS,
            status_code: last_status,
            error: last_error,
        })
    }

    async fn attempt_once(
        &self,
        url: &str,
        signing_key: &str,
        body: &[u8],
    ) -> Result<StatusCode, DispatchError> {
        let mut target = url.to_string();

        for hop in 0..=MAX_REDIRECTS {
            validate_outbound_url(&target, self.allow_private).await?;

            let timestamp = Utc::now().timestamp();
            let signature = sign_payload(signing_key, timestamp, body);

            let mut req = self
                .client
                .post(&target)
                .header("Content-Type", "application/json")
                .header("X-Timestamp", timestamp.to_string())
                .header("X-Signature-256", format!("sha256={signature}"))
                .body(body.to_vec());
            req = req.header("User-Agent", "stream-monitor-webhook/0.1");

            let resp = req
                .send()
                .await
                .map_err(|e| DispatchError::Exhausted {
                    attempts: hop as u32 + 1,
                    last_error: e.to_string(),
                })?;

            if resp.status().is_redirection() {
                let Some(location) = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Ok(resp.status());
                };
                target = location.to_string();
                debug!(hop, target, "following webhook redirect");
                continue;
            }

            return Ok(resp.status());
        }

        Err(DispatchError::Exhausted {
            attempts: MAX_REDIRECTS as u32,
            last_error: "too many redirects".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_matches_schedule() {
        assert_eq!(retry_delay(1), Duration::ZERO);
        assert_eq!(retry_delay(2), Duration::from_secs(1));
        assert_eq!(retry_delay(3), Duration::from_secs(2));
        assert_eq!(retry_delay(4), Duration::from_secs(4));
        assert!(retry_delay(5) <= Duration::from_secs(10));
        assert!(retry_delay(9) <= Duration::from_secs(10));
    }

    #[test]
    fn sign_verify_round_trip() {
        let now = Utc::now();
        let ts = now.timestamp();
        let body = br#"{"event_type":"test","monitor_id":"mon-123"}"#;
        let sig = sign_payload("test-secret-key", ts, body);
        assert_eq!(sig.len(), 64);
        assert!(verify_signature("test-secret-key", &sig, ts, body, now));
    }

    #[test]
    fn verify_fails_on_tampered_inputs() {
        let now = Utc::now();
        let ts = now.timestamp();
        let body = b"{}";
        let sig = sign_payload("k", ts, body);

        assert!(!verify_signature("wrong-key", &sig, ts, body, now));
        assert!(!verify_signature("k", &sig, ts, b"{\"x\":1}", now));
        assert!(!verify_signature("k", "00".repeat(32).as_str(), ts, body, now));
    }

    #[test]
    fn verify_rejects_stale_timestamp() {
        let now = Utc::now();
        let stale_ts = now.timestamp() - 400;
        let body = b"{}";
        let sig = sign_payload("k", stale_ts, body);
        assert!(!verify_signature("k", &sig, stale_ts, body, now));
    }

    #[test]
    fn fixed_body_yields_stable_signature_shape_across_timestamps() {
        let body = b"identical-body";
        let sig_a = sign_payload("k", 1_700_000_000, body);
        let sig_b = sign_payload("k", 1_700_000_001, body);
        assert_ne!(sig_a, sig_b);
        assert_eq!(sig_a.len(), sig_b.len());
    }
}
