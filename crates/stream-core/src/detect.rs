//! Symmetric defect-detection FSM applied twice per worker (video
//! blackout, audio silence). State lives entirely in the worker's own
//! memory — the Gateway never needs it.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectKind {
    Blackout,
    Silence,
}

impl DefectKind {
    fn alert_event(self) -> &'static str {
        match self {
            Self::Blackout => "alert.blackout",
            Self::Silence => "alert.silence",
        }
    }

    fn recovered_event(self) -> &'static str {
        match self {
            Self::Blackout => "alert.blackout_recovered",
            Self::Silence => "alert.silence_recovered",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertData {
    pub duration_sec: f64,
    pub started_at: DateTime<Utc>,
    pub threshold_sec: u64,
    pub segment_info: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveredData {
    pub total_duration_sec: f64,
    pub started_at: DateTime<Utc>,
    pub recovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum DetectorOutcome {
    None,
    Alert { event_type: &'static str, data: AlertData },
    Recovered { event_type: &'static str, data: RecoveredData },
}

/// Fires immediately on the first fully-defective segment, regardless of
/// the configured threshold — the threshold is advisory payload data
/// only. This is an explicit, retained design decision, not a bug.
pub struct DefectDetector {
    kind: DefectKind,
    threshold_sec: u64,
    consecutive_duration_sec: f64,
    alert_start: Option<DateTime<Utc>>,
    alert_sent: bool,
    event_count: u64,
}

impl DefectDetector {
    pub fn new(kind: DefectKind, threshold_sec: u64) -> Self {
        Self {
            kind,
            threshold_sec,
            consecutive_duration_sec: 0.0,
            alert_start: None,
            alert_sent: false,
            event_count: 0,
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn is_alerting(&self) -> bool {
        self.alert_sent
    }

    pub fn feed(&mut self, fully_defective: bool, segment_duration_sec: f64, segment_info: serde_json::Value) -> DetectorOutcome {
        if fully_defective {
            self.consecutive_duration_sec += segment_duration_sec;

            if !self.alert_sent {
                let started_at = Utc::now();
                self.alert_start = Some(started_at);
                self.alert_sent = true;
                self.event_count += 1;
                return DetectorOutcome::Alert {
                    event_type: self.kind.alert_event(),
                    data: AlertData {
                        duration_sec: self.consecutive_duration_sec,
                        started_at,
                        threshold_sec: self.threshold_sec,
                        segment_info,
                    },
                };
            }
            DetectorOutcome::None
        } else if self.alert_sent {
            let recovered_at = Utc::now();
            let started_at = self.alert_start.unwrap_or(recovered_at);
            let total_duration_sec = self.consecutive_duration_sec;

            self.consecutive_duration_sec = 0.0;
            self.alert_start = None;
            self.alert_sent = false;

            DetectorOutcome::Recovered {
                event_type: self.kind.recovered_event(),
                data: RecoveredData {
                    total_duration_sec,
                    started_at,
                    recovered_at,
                },
            }
        } else {
            DetectorOutcome::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fires_exactly_one_alert_for_consecutive_defective_segments() {
        let mut d = DefectDetector::new(DefectKind::Blackout, 30);

        let first = d.feed(true, 2.0, json!({"seq": 1}));
        assert!(matches!(first, DetectorOutcome::Alert { .. }));
        if let DetectorOutcome::Alert { data, .. } = first {
            assert_eq!(data.duration_sec, 2.0);
        }

        let second = d.feed(true, 2.0, json!({"seq": 2}));
        assert!(matches!(second, DetectorOutcome::None));
        let third = d.feed(true, 2.0, json!({"seq": 3}));
        assert!(matches!(third, DetectorOutcome::None));

        assert_eq!(d.event_count(), 1);
        assert!(d.is_alerting());
    }

    #[test]
    fn recovers_exactly_once_after_defect_clears() {
        let mut d = DefectDetector::new(DefectKind::Silence, 30);
        d.feed(true, 2.0, json!({}));
        d.feed(true, 2.0, json!({}));

        let recovered = d.feed(false, 2.0, json!({}));
        assert!(matches!(recovered, DetectorOutcome::Recovered { .. }));
        if let DetectorOutcome::Recovered { data, .. } = recovered {
            assert_eq!(data.total_duration_sec, 4.0);
        }
        assert!(!d.is_alerting());

        // A second clean segment produces no further recovery event.
        let again = d.feed(false, 2.0, json!({}));
        assert!(matches!(again, DetectorOutcome::None));
    }

    #[test]
    fn fires_immediately_regardless_of_threshold() {
        let mut d = DefectDetector::new(DefectKind::Blackout, 9999);
        let outcome = d.feed(true, 0.5, json!({}));
        assert!(matches!(outcome, DetectorOutcome::Alert { .. }));
    }
}
