use thiserror::Error;

/// Boundary error for `WebhookDispatcher`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("callback URL rejected by SSRF guard: {0}")]
    Ssrf(#[from] crate::ssrf::SsrfError),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("delivery exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Boundary error for the worker state machine.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("manifest fetch failed: {0}")]
    Manifest(String),
    #[error("segment fetch failed: {0}")]
    Segment(String),
    #[error("stream probe failed: {0}")]
    Probe(String),
    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] DispatchError),
    #[error("internal control-plane call failed: {0}")]
    ControlPlane(String),
}
