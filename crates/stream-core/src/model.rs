//! Shared domain types: `Monitor`, its tuning config, stats, and the
//! append-only audit `Event`. These are the wire/DB shapes every other
//! crate builds on; treat `metadata`/`payload` as opaque JSON per the
//! design notes — nothing here schema-validates them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tuning record embedded in a `Monitor`. Mirrors the builder-style
/// defaults pattern used throughout this codebase's config structs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    pub check_interval_sec: u64,
    pub blackout_threshold_sec: u64,
    pub silence_threshold_sec: u64,
    pub silence_db_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub start_delay_tolerance_sec: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_sec: 10,
            blackout_threshold_sec: 30,
            silence_threshold_sec: 30,
            silence_db_threshold: -50.0,
            scheduled_start_time: None,
            start_delay_tolerance_sec: 300,
        }
    }
}

impl MonitorConfig {
    pub fn with_check_interval_sec(mut self, v: u64) -> Self {
        self.check_interval_sec = v;
        self
    }

    pub fn with_blackout_threshold_sec(mut self, v: u64) -> Self {
        self.blackout_threshold_sec = v;
        self
    }

    pub fn with_silence_threshold_sec(mut self, v: u64) -> Self {
        self.silence_threshold_sec = v;
        self
    }

    pub fn with_silence_db_threshold(mut self, v: f64) -> Self {
        self.silence_db_threshold = v;
        self
    }

    pub fn with_scheduled_start_time(mut self, v: Option<DateTime<Utc>>) -> Self {
        self.scheduled_start_time = v;
        self
    }

    pub fn with_start_delay_tolerance_sec(mut self, v: u64) -> Self {
        self.start_delay_tolerance_sec = v;
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_sec)
    }

    /// Rejects non-positive check intervals and negative thresholds per
    /// the Monitor config invariants in the data model.
    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval_sec == 0 {
            return Err("check_interval_sec must be > 0".into());
        }
        if self.silence_db_threshold >= 0.0 {
            return Err("silence_db_threshold must be negative".into());
        }
        Ok(())
    }
}

/// `initializing | waiting | monitoring` are active and mutable;
/// `completed | stopped | error` are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Initializing,
    Waiting,
    Monitoring,
    Completed,
    Stopped,
    Error,
}

impl MonitorStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Waiting | Self::Monitoring
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Active statuses flow monotonically forward or drop straight to a
    /// terminal status; terminal statuses never transition again.
    pub fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, target) {
            (Self::Initializing, Self::Waiting) => true,
            (Self::Initializing, Self::Monitoring) => true,
            (Self::Waiting, Self::Monitoring) => true,
            (_, Self::Completed) | (_, Self::Stopped) | (_, Self::Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Waiting => "waiting",
            Self::Monitoring => "monitoring",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    Warning,
    Error,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Unknown,
    Scheduled,
    Live,
    Ended,
}

/// Primary entity: a durable declaration that a stream URL should be
/// observed until explicitly stopped or naturally completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub stream_url: String,
    pub callback_url: String,
    pub config: MonitorConfig,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub status: MonitorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Monitor {
    pub fn new_id() -> String {
        format!("mon-{}", Uuid::now_v7())
    }
}

/// 1:1 with `Monitor`, same id. Counters only ever increase while the
/// owning monitor is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    pub monitor_id: String,
    pub total_segments: u64,
    pub blackout_events: u64,
    pub silence_events: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    pub video_health: Health,
    pub audio_health: Health,
    pub stream_status: StreamStatus,
}

impl MonitorStats {
    pub fn new(monitor_id: impl Into<String>) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            total_segments: 0,
            blackout_events: 0,
            silence_events: 0,
            last_check_at: None,
            video_health: Health::Unknown,
            audio_health: Health::Unknown,
            stream_status: StreamStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSummary {
    pub monitor: Monitor,
    pub stats: MonitorStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventWebhookStatus {
    Pending,
    Sent,
    Failed,
}

/// Append-only audit row recording one webhook attempt (or attempt set)
/// against a monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub monitor_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub webhook_status: EventWebhookStatus,
    pub webhook_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(monitor_id: impl Into<String>, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            monitor_id: monitor_id.into(),
            event_type: event_type.into(),
            payload,
            webhook_status: EventWebhookStatus::Pending,
            webhook_attempts: 0,
            webhook_last_error: None,
            created_at: Utc::now(),
            sent_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_transitions_are_monotone() {
        assert!(MonitorStatus::Initializing.can_transition_to(MonitorStatus::Waiting));
        assert!(MonitorStatus::Waiting.can_transition_to(MonitorStatus::Monitoring));
        assert!(MonitorStatus::Monitoring.can_transition_to(MonitorStatus::Completed));
    }

    #[test]
    fn terminal_statuses_never_transition() {
        assert!(!MonitorStatus::Completed.can_transition_to(MonitorStatus::Waiting));
        assert!(!MonitorStatus::Error.can_transition_to(MonitorStatus::Monitoring));
        assert!(!MonitorStatus::Stopped.can_transition_to(MonitorStatus::Error));
    }

    #[test]
    fn active_set_membership() {
        assert!(MonitorStatus::Initializing.is_active());
        assert!(MonitorStatus::Waiting.is_active());
        assert!(MonitorStatus::Monitoring.is_active());
        assert!(!MonitorStatus::Completed.is_active());
        assert!(!MonitorStatus::Stopped.is_active());
        assert!(!MonitorStatus::Error.is_active());
    }

    #[test]
    fn config_validate_rejects_zero_interval() {
        let cfg = MonitorConfig::default().with_check_interval_sec(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_validate_rejects_non_negative_silence_threshold() {
        let cfg = MonitorConfig::default().with_silence_db_threshold(5.0);
        assert!(cfg.validate().is_err());
    }
}
