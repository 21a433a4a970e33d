//! Environment parsing and validation for both binaries this crate
//! produces. Every `std::env::var` call in the process lives here —
//! `main.rs` only ever reads already-typed, already-validated config.

use std::time::Duration;

use serde::Deserialize;
use stream_core::MonitorConfig;
use stream_worker::WorkerConfig;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn require_string(key: &str) -> Result<String, String> {
    env_string(key).ok_or_else(|| format!("{key} must be set"))
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env_string(key) {
        Some(v) => v.parse().map_err(|_| format!("{key} is not a valid value: {v}")),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, String> {
    match env_string(key) {
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(format!("{key} is not a valid bool: {other}")),
        },
        None => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration, String> {
    Ok(Duration::from_secs(env_parsed(key, default_secs)?))
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration, String> {
    Ok(Duration::from_millis(env_parsed(key, default_ms)?))
}

/// Config the `gateway` subcommand needs to stand up the HTTP API, its
/// repository, its pod manager, and the reconciliation loop.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub environment: String,
    pub db_dsn: String,
    pub api_key: String,
    pub internal_api_key: String,
    pub webhook_signing_key: String,
    pub reconciliation_webhook_url: Option<String>,
    pub namespace: String,
    pub worker_image: String,
    pub worker_image_tag: String,
    pub in_cluster: bool,
    pub max_monitors: u64,
    pub reconcile_on_boot: bool,
    pub reconcile_interval: Duration,
    pub reconcile_timeout: Duration,
    pub monitor_retention_period: Duration,
    pub cleanup_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, String> {
        let db_dsn = env_string("DB_DSN")
            .or_else(|| env_string("DATABASE_URL"))
            .ok_or_else(|| "DB_DSN or DATABASE_URL must be set".to_string())?;

        let config = Self {
            port: env_parsed("PORT", 8080u16)?,
            environment: env_string("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            db_dsn,
            api_key: require_string("API_KEY")?,
            internal_api_key: require_string("INTERNAL_API_KEY")?,
            webhook_signing_key: require_string("WEBHOOK_SIGNING_KEY")?,
            reconciliation_webhook_url: env_string("RECONCILIATION_WEBHOOK_URL"),
            namespace: env_string("NAMESPACE").unwrap_or_else(|| "default".to_string()),
            worker_image: require_string("WORKER_IMAGE")?,
            worker_image_tag: env_string("WORKER_IMAGE_TAG").unwrap_or_else(|| "latest".to_string()),
            in_cluster: env_bool("IN_CLUSTER", false)?,
            max_monitors: env_parsed("MAX_MONITORS", 1000u64)?,
            reconcile_on_boot: env_bool("RECONCILE_ON_BOOT", true)?,
            reconcile_interval: env_secs("RECONCILE_INTERVAL", 60)?,
            reconcile_timeout: env_secs("RECONCILE_TIMEOUT", 30)?,
            monitor_retention_period: env_secs("MONITOR_RETENTION_PERIOD", 7 * 24 * 3600)?,
            cleanup_interval: env_secs("CLEANUP_INTERVAL", 3600)?,
            read_timeout: env_secs("READ_TIMEOUT", 15)?,
            write_timeout: env_secs("WRITE_TIMEOUT", 15)?,
            shutdown_timeout: env_secs("SHUTDOWN_TIMEOUT", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("PORT must be > 0".into());
        }
        if self.worker_image.is_empty() {
            return Err("WORKER_IMAGE must not be empty".into());
        }
        if self.max_monitors == 0 {
            return Err("MAX_MONITORS must be > 0".into());
        }
        Ok(())
    }

    pub fn worker_image_ref(&self) -> String {
        format!("{}:{}", self.worker_image, self.worker_image_tag)
    }
}

/// Mirrors `MonitorConfig`'s fields as all-optional so `CONFIG_JSON` only
/// needs to carry the subset an operator wants to override.
#[derive(Debug, Deserialize, Default)]
struct MonitorConfigOverride {
    check_interval_sec: Option<u64>,
    blackout_threshold_sec: Option<u64>,
    silence_threshold_sec: Option<u64>,
    silence_db_threshold: Option<f64>,
    scheduled_start_time: Option<chrono::DateTime<chrono::Utc>>,
    start_delay_tolerance_sec: Option<u64>,
}

impl MonitorConfigOverride {
    fn apply(self, mut base: MonitorConfig) -> MonitorConfig {
        if let Some(v) = self.check_interval_sec {
            base = base.with_check_interval_sec(v);
        }
        if let Some(v) = self.blackout_threshold_sec {
            base = base.with_blackout_threshold_sec(v);
        }
        if let Some(v) = self.silence_threshold_sec {
            base = base.with_silence_threshold_sec(v);
        }
        if let Some(v) = self.silence_db_threshold {
            base = base.with_silence_db_threshold(v);
        }
        if self.scheduled_start_time.is_some() {
            base = base.with_scheduled_start_time(self.scheduled_start_time);
        }
        if let Some(v) = self.start_delay_tolerance_sec {
            base = base.with_start_delay_tolerance_sec(v);
        }
        base
    }
}

/// Builds the `WorkerConfig` a worker process's `main` hands to the
/// `WorkerStateMachine`. The shared secrets (`INTERNAL_API_KEY`,
/// `WEBHOOK_SIGNING_KEY`) are read here too: the orchestrator injects them
/// into the worker pod under the same names it uses for the gateway.
pub fn worker_config_from_env() -> Result<WorkerConfig, String> {
    let mut tuning = MonitorConfig::default()
        .with_check_interval_sec(env_parsed("ANALYSIS_INTERVAL", 10u64)?)
        .with_blackout_threshold_sec(env_parsed("BLACKOUT_THRESHOLD", 30u64)?)
        .with_silence_threshold_sec(env_parsed("SILENCE_THRESHOLD", 30u64)?)
        .with_start_delay_tolerance_sec(env_parsed("DELAY_THRESHOLD", 300u64)?);

    if let Some(raw) = env_string("CONFIG_JSON") {
        let over: MonitorConfigOverride =
            serde_json::from_str(&raw).map_err(|e| format!("CONFIG_JSON is not valid JSON: {e}"))?;
        tuning = over.apply(tuning);
    }

    let metadata = match env_string("METADATA_JSON") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("METADATA_JSON is not valid JSON: {e}"))?,
        None => serde_json::Value::Null,
    };

    let config = WorkerConfig {
        monitor_id: require_string("MONITOR_ID")?,
        stream_url: require_string("STREAM_URL")?,
        callback_url: require_string("CALLBACK_URL")?,
        control_plane_url: require_string("WEBHOOK_URL")?,
        internal_api_key: require_string("INTERNAL_API_KEY")?,
        webhook_signing_key: require_string("WEBHOOK_SIGNING_KEY")?,
        waiting_initial_interval: env_millis("WAITING_MODE_INITIAL_INTERVAL", 10_000)?,
        waiting_delayed_interval: env_millis("WAITING_MODE_DELAYED_INTERVAL", 60_000)?,
        manifest_fetch_timeout: env_secs("MANIFEST_FETCH_TIMEOUT", 10)?,
        manifest_refresh_interval: env_secs("MANIFEST_REFRESH_INTERVAL", 300)?,
        segment_fetch_timeout: env_secs("SEGMENT_FETCH_TIMEOUT", 10)?,
        segment_max_bytes: env_parsed("SEGMENT_MAX_BYTES", 50_000_000u64)?,
        check_interval: tuning.check_interval(),
        tuning,
        metadata,
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_config_override_only_changes_present_fields() {
        let base = MonitorConfig::default();
        let over = MonitorConfigOverride {
            silence_db_threshold: Some(-40.0),
            ..Default::default()
        };
        let merged = over.apply(base.clone());
        assert_eq!(merged.silence_db_threshold, -40.0);
        assert_eq!(merged.check_interval_sec, base.check_interval_sec);
        assert_eq!(merged.blackout_threshold_sec, base.blackout_threshold_sec);
    }

    #[test]
    fn monitor_config_override_empty_is_identity() {
        let base = MonitorConfig::default().with_blackout_threshold_sec(45);
        let merged = MonitorConfigOverride::default().apply(base.clone());
        assert_eq!(merged, base);
    }
}
