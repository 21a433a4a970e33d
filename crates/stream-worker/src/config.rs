//! Typed shape of a worker process's runtime configuration. Parsing and
//! validating the raw environment lives in `stream-cli`; this crate only
//! owns the shape the state machine actually consumes.

use std::time::Duration;

use stream_core::MonitorConfig;

/// Everything a `WorkerStateMachine` needs to run one monitor to
/// completion. One instance per worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub monitor_id: String,
    pub stream_url: String,
    /// Operator-supplied URL webhooks are delivered to directly.
    pub callback_url: String,
    /// Cluster-internal Gateway base URL for the status/terminate/events calls.
    pub control_plane_url: String,
    pub internal_api_key: String,
    pub webhook_signing_key: String,

    pub waiting_initial_interval: Duration,
    pub waiting_delayed_interval: Duration,
    pub manifest_fetch_timeout: Duration,
    pub manifest_refresh_interval: Duration,
    pub segment_fetch_timeout: Duration,
    pub segment_max_bytes: u64,
    /// `ANALYSIS_INTERVAL` — the monitoring loop's per-cycle tick.
    pub check_interval: Duration,

    /// Blackout/silence/silence-db/delay thresholds plus an optional
    /// `scheduled_start_time`, reusing the Gateway's own config shape so
    /// `CONFIG_JSON` overrides can be applied with the same validation.
    pub tuning: MonitorConfig,

    pub metadata: serde_json::Value,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.monitor_id.is_empty() {
            return Err("monitor_id must not be empty".into());
        }
        if self.stream_url.is_empty() {
            return Err("stream_url must not be empty".into());
        }
        if self.callback_url.is_empty() {
            return Err("callback_url must not be empty".into());
        }
        if self.control_plane_url.is_empty() {
            return Err("control_plane_url must not be empty".into());
        }
        if self.segment_max_bytes == 0 {
            return Err("segment_max_bytes must be > 0".into());
        }
        self.tuning.validate()
    }
}
