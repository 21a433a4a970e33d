#![forbid(unsafe_code)]

pub mod detect;
pub mod error;
pub mod manifest;
pub mod model;
pub mod ssrf;
pub mod webhook;

pub use detect::{DefectDetector, DefectKind, DetectorOutcome};
pub use error::{DispatchError, WorkerError};
pub use manifest::{DashManifestSource, HlsManifestSource, LatestSegment, ManifestSource};
pub use model::{
    Event, EventWebhookStatus, Health, Monitor, MonitorConfig, MonitorStatus, MonitorSummary,
    StreamStatus,
};
pub use ssrf::{validate_outbound_url, SsrfError};
pub use webhook::{
    retry_delay, sign_payload, verify_signature, webhook_headers, WebhookAttemptResult,
    WebhookDispatcher, WebhookEvent, WebhookPayload,
};
