//! The per-monitor worker state machine: waiting → monitoring →
//! completed/error/stopped. One instance owns one monitor end to end,
//! the same "single main loop with a ticker" shape as the teacher's
//! `Monitor::start`, generalized from a multi-stream poll to a single
//! stream's full lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use stream_core::{
    DefectDetector, DefectKind, DetectorOutcome, EventWebhookStatus, Health, ManifestSource, StreamStatus,
    WebhookDispatcher, WebhookEvent, WebhookPayload, WorkerError,
};

use crate::analyzer::SegmentAnalyzer;
use crate::config::WorkerConfig;
use crate::control_client::ControlPlaneClient;
use crate::prober::{LiveStatus, StreamProber};

const LIVENESS_RECHECK_INTERVAL: Duration = Duration::from_secs(300);
const SUSPENSION_THRESHOLD: Duration = Duration::from_secs(10);
const SEGMENT_ERROR_WINDOW: Duration = Duration::from_secs(60);
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Stopped,
    Error,
}

enum WaitOutcome {
    WentLive(Option<String>),
    StreamEnded,
    Cancelled,
}

/// Tracks the last segment seen so a refreshed manifest URL or a repeat
/// fetch of the same segment never double-counts or double-alerts.
struct SegmentTracker {
    last_sequence: Option<u64>,
    last_url: Option<String>,
    last_seen_at: Instant,
    suspended: bool,
    rebaseline: bool,
}

impl SegmentTracker {
    fn new() -> Self {
        Self {
            last_sequence: None,
            last_url: None,
            last_seen_at: Instant::now(),
            suspended: false,
            rebaseline: false,
        }
    }

    fn is_duplicate(&self, sequence: u64, url: &str) -> bool {
        if let Some(last) = self.last_sequence {
            if sequence < last {
                return true;
            }
            if sequence == last && self.last_url.as_deref() == Some(url) {
                return true;
            }
        }
        false
    }

    fn advance(&mut self, sequence: u64, url: &str) {
        self.last_sequence = Some(sequence);
        self.last_url = Some(url.to_string());
        self.last_seen_at = Instant::now();
    }
}

pub struct WorkerStateMachine {
    config: WorkerConfig,
    prober: Arc<dyn StreamProber>,
    manifest: Arc<dyn ManifestSource>,
    analyzer: Arc<dyn SegmentAnalyzer>,
    dispatcher: Arc<WebhookDispatcher>,
    control: Arc<ControlPlaneClient>,
    http: reqwest::Client,
    total_segments: u64,
    blackout_events: u64,
    silence_events: u64,
    audit_tasks: Vec<JoinHandle<()>>,
}

impl WorkerStateMachine {
    pub fn new(
        config: WorkerConfig,
        prober: Arc<dyn StreamProber>,
        manifest: Arc<dyn ManifestSource>,
        analyzer: Arc<dyn SegmentAnalyzer>,
        dispatcher: Arc<WebhookDispatcher>,
        control: Arc<ControlPlaneClient>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            prober,
            manifest,
            analyzer,
            dispatcher,
            control,
            http,
            total_segments: 0,
            blackout_events: 0,
            silence_events: 0,
            audit_tasks: Vec::new(),
        }
    }

    /// Drives the monitor to a terminal outcome. `cancel` flips to
    /// `true` on SIGTERM; every suspension point in the waiting and
    /// monitoring loops checks it before sleeping again.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> Outcome {
        let outcome = match self.waiting_loop(&mut cancel).await {
            Ok(WaitOutcome::WentLive(title)) => self.monitoring_loop(&mut cancel, title).await,
            Ok(WaitOutcome::StreamEnded) => Outcome::Completed,
            Ok(WaitOutcome::Cancelled) => Outcome::Stopped,
            Err(WorkerError::Webhook(_)) => self.fail_on_webhook_delivery().await,
            Err(e) => {
                warn!(monitor_id = %self.config.monitor_id, error = %e, "waiting loop aborted");
                Outcome::Error
            }
        };

        self.drain_audit_tasks().await;
        let status = match outcome {
            Outcome::Completed => "completed",
            Outcome::Stopped => "stopped",
            Outcome::Error => "error",
        };
        if let Err(e) = self.control.heartbeat(&self.config.monitor_id, status, None, None, None).await {
            warn!(monitor_id = %self.config.monitor_id, error = %e, "final heartbeat failed");
        }
        outcome
    }

    async fn fail_on_webhook_delivery(&self) -> Outcome {
        if let Err(e) = self
            .control
            .terminate(&self.config.monitor_id, "webhook_delivery_failed")
            .await
        {
            warn!(monitor_id = %self.config.monitor_id, error = %e, "self-terminate call failed after webhook delivery exhaustion");
        }
        Outcome::Error
    }

    /// Resolves to the stream going live, the probe reporting the stream
    /// already ended before it ever started, or cancellation. `Err` only
    /// signals webhook delivery failure (the uniform failure policy).
    async fn waiting_loop(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<WaitOutcome, WorkerError> {
        let scheduled = self.config.tuning.scheduled_start_time;
        let tolerance = Duration::from_secs(self.config.tuning.start_delay_tolerance_sec);
        let mut delay_notice_sent = false;

        loop {
            if *cancel.borrow() {
                return Ok(WaitOutcome::Cancelled);
            }

            match self.prober.is_live(&self.config.stream_url).await {
                Ok(LiveStatus::Live { title }) => {
                    self.emit(
                        WebhookEvent::StreamStarted,
                        json!({ "title": title.clone() }),
                    )
                    .await?;
                    return Ok(WaitOutcome::WentLive(title));
                }
                Ok(LiveStatus::WasLive) => {
                    self.emit(WebhookEvent::StreamEnded, json!({ "reason": "probe_reported_ended" })).await?;
                    return Ok(WaitOutcome::StreamEnded);
                }
                Ok(LiveStatus::NotLive) => {}
                Err(e) => warn!(monitor_id = %self.config.monitor_id, error = %e, "liveness probe failed, retrying"),
            }

            let now = chrono::Utc::now();
            let past_scheduled = scheduled.is_some_and(|s| now >= s);
            if !delay_notice_sent {
                if let Some(s) = scheduled {
                    if now >= s + chrono::Duration::from_std(tolerance).unwrap_or_default() {
                        self.emit(WebhookEvent::StreamDelayed, json!({ "scheduled_start_time": s })).await?;
                        delay_notice_sent = true;
                    }
                }
            }

            let interval = if past_scheduled {
                self.config.waiting_delayed_interval
            } else {
                self.config.waiting_initial_interval
            };

            if !Self::sleep_or_cancel(interval, cancel).await {
                return Ok(WaitOutcome::Cancelled);
            }
        }
    }

    async fn monitoring_loop(&mut self, cancel: &mut watch::Receiver<bool>, title: Option<String>) -> Outcome {
        let _ = title;
        let mut manifest_url = match self.prober.get_manifest(&self.config.stream_url).await {
            Ok(u) => u,
            Err(e) => {
                warn!(monitor_id = %self.config.monitor_id, error = %e, "failed to resolve initial manifest url");
                return Outcome::Error;
            }
        };

        let mut tracker = SegmentTracker::new();
        let mut blackout = DefectDetector::new(DefectKind::Blackout, self.config.tuning.blackout_threshold_sec);
        let mut silence = DefectDetector::new(DefectKind::Silence, self.config.tuning.silence_threshold_sec);

        let mut last_liveness_check = Instant::now();
        let mut last_manifest_refresh = Instant::now();
        let mut segment_error_window_start: Option<Instant> = None;

        loop {
            if *cancel.borrow() {
                return Outcome::Stopped;
            }

            if last_manifest_refresh.elapsed() >= self.config.manifest_refresh_interval {
                last_manifest_refresh = Instant::now();
                match self.prober.get_manifest(&self.config.stream_url).await {
                    Ok(fresh) if fresh != manifest_url => {
                        manifest_url = fresh;
                        tracker.rebaseline = true;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(monitor_id = %self.config.monitor_id, error = %e, "manifest refresh failed"),
                }
            }

            if last_liveness_check.elapsed() >= LIVENESS_RECHECK_INTERVAL {
                last_liveness_check = Instant::now();
                match self.prober.is_live(&self.config.stream_url).await {
                    Ok(LiveStatus::Live { .. }) => {}
                    Ok(_) => {
                        return self
                            .end_stream(cancel, "stream_no_longer_live")
                            .await;
                    }
                    Err(e) => warn!(monitor_id = %self.config.monitor_id, error = %e, "re-probe failed, continuing"),
                }
            }

            let snapshot = match self.manifest.fetch(&manifest_url).await {
                Ok(s) => {
                    segment_error_window_start = None;
                    s
                }
                Err(e) => {
                    match self
                        .handle_segment_error(&mut segment_error_window_start, &e, cancel)
                        .await
                    {
                        Some(outcome) => return outcome,
                        None => {
                            if !Self::sleep_or_cancel(self.config.check_interval, cancel).await {
                                return Outcome::Stopped;
                            }
                            continue;
                        }
                    }
                }
            };

            if snapshot.end_of_stream {
                return self.end_stream(cancel, "endlist_detected").await;
            }

            let Some(segment) = snapshot.latest_segment else {
                if !Self::sleep_or_cancel(self.config.check_interval, cancel).await {
                    return Outcome::Stopped;
                }
                continue;
            };

            if tracker.is_duplicate(segment.sequence, &segment.url) {
                if tracker.last_seen_at.elapsed() >= SUSPENSION_THRESHOLD && !tracker.suspended && !tracker.rebaseline {
                    tracker.suspended = true;
                    if let Err(e) = self.emit(WebhookEvent::StreamSuspended, json!({})).await {
                        return self.on_emit_error(e).await;
                    }
                }
                if !Self::sleep_or_cancel(self.config.check_interval, cancel).await {
                    return Outcome::Stopped;
                }
                continue;
            }

            let was_suspended = tracker.suspended;
            let was_rebaseline = tracker.rebaseline;
            tracker.advance(segment.sequence, &segment.url);
            tracker.suspended = false;
            tracker.rebaseline = false;

            if was_suspended && !was_rebaseline {
                if let Err(e) = self.emit(WebhookEvent::StreamResumed, json!({})).await {
                    return self.on_emit_error(e).await;
                }
            }

            match self.analyze_segment(&segment.url).await {
                Ok(result) => {
                    self.total_segments += 1;

                    match blackout.feed(result.black, segment.duration_sec, json!({ "sequence": segment.sequence, "url": segment.url })) {
                        DetectorOutcome::Alert { event_type, data } => {
                            self.blackout_events += 1;
                            if let Err(e) = self.emit_raw(event_type, serde_json::to_value(&data).unwrap_or_default()).await {
                                return self.on_emit_error(e).await;
                            }
                        }
                        DetectorOutcome::Recovered { event_type, data } => {
                            if let Err(e) = self.emit_raw(event_type, serde_json::to_value(&data).unwrap_or_default()).await {
                                return self.on_emit_error(e).await;
                            }
                        }
                        DetectorOutcome::None => {}
                    }

                    match silence.feed(result.silent, segment.duration_sec, json!({ "sequence": segment.sequence, "url": segment.url })) {
                        DetectorOutcome::Alert { event_type, data } => {
                            self.silence_events += 1;
                            if let Err(e) = self.emit_raw(event_type, serde_json::to_value(&data).unwrap_or_default()).await {
                                return self.on_emit_error(e).await;
                            }
                        }
                        DetectorOutcome::Recovered { event_type, data } => {
                            if let Err(e) = self.emit_raw(event_type, serde_json::to_value(&data).unwrap_or_default()).await {
                                return self.on_emit_error(e).await;
                            }
                        }
                        DetectorOutcome::None => {}
                    }
                }
                Err(e) => {
                    match self
                        .handle_segment_error(&mut segment_error_window_start, &e, cancel)
                        .await
                    {
                        Some(outcome) => return outcome,
                        None => {}
                    }
                }
            }

            let health = (
                if blackout.is_alerting() { Health::Error } else { Health::Ok },
                if silence.is_alerting() { Health::Error } else { Health::Ok },
            );
            if let Err(e) = self
                .control
                .heartbeat(
                    &self.config.monitor_id,
                    "monitoring",
                    Some(StreamStatus::Live),
                    Some(health),
                    Some(self.total_segments),
                )
                .await
            {
                warn!(monitor_id = %self.config.monitor_id, error = %e, "heartbeat failed");
            }

            if !Self::sleep_or_cancel(self.config.check_interval, cancel).await {
                return Outcome::Stopped;
            }
        }
    }

    /// Webhook delivery exhaustion during the monitoring loop follows the
    /// same failure policy as the waiting loop: self-terminate rather
    /// than leave the monitor stuck in `monitoring` with a dead worker.
    async fn on_emit_error(&self, e: WorkerError) -> Outcome {
        warn!(monitor_id = %self.config.monitor_id, error = %e, "webhook delivery exhausted during monitoring");
        self.fail_on_webhook_delivery().await
    }

    async fn end_stream(&mut self, cancel: &mut watch::Receiver<bool>, reason: &'static str) -> Outcome {
        let _ = cancel;
        match self.emit(WebhookEvent::StreamEnded, json!({ "reason": reason })).await {
            Ok(()) => Outcome::Completed,
            Err(e) => self.on_emit_error(e).await,
        }
    }

    /// Transient segment errors get a 60s grace window before anything
    /// fires. Returns `Some(outcome)` when the window has been resolved
    /// one way or another, `None` to keep retrying within the window.
    async fn handle_segment_error(
        &mut self,
        window_start: &mut Option<Instant>,
        error: &WorkerError,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Outcome> {
        let start = *window_start.get_or_insert_with(Instant::now);
        if start.elapsed() < SEGMENT_ERROR_WINDOW {
            return None;
        }

        match self.prober.is_live(&self.config.stream_url).await {
            Ok(LiveStatus::Live { .. }) => {
                if let Err(e) = self.emit(WebhookEvent::AlertSegmentError, json!({ "error": error.to_string() })).await {
                    return Some(self.on_emit_error(e).await);
                }
                *window_start = None;
                None
            }
            _ => {
                let _ = cancel;
                Some(self.end_stream_with_reason("segment_error_threshold").await)
            }
        }
    }

    async fn end_stream_with_reason(&mut self, reason: &'static str) -> Outcome {
        match self.emit(WebhookEvent::StreamEnded, json!({ "reason": reason })).await {
            Ok(()) => Outcome::Completed,
            Err(e) => self.on_emit_error(e).await,
        }
    }

    /// Downloads the segment into a scratch file (size-capped), runs the
    /// analyzer on a detached task so shutdown never interrupts it
    /// mid-analysis, then removes the scratch file.
    async fn analyze_segment(&mut self, segment_url: &str) -> Result<crate::analyzer::AnalysisResult, WorkerError> {
        let bytes = self.download_segment(segment_url).await?;

        let path = std::env::temp_dir().join(format!(
            "stream-worker-{}-{}.seg",
            self.config.monitor_id,
            Uuid::now_v7()
        ));
        tokio::fs::write(&path, &bytes).await.map_err(|e| WorkerError::Segment(e.to_string()))?;

        let analyzer = Arc::clone(&self.analyzer);
        let detached_path = path.clone();
        let handle = tokio::spawn(async move { analyzer.analyze(&detached_path).await });

        let result = handle.await.map_err(|e| WorkerError::Segment(format!("analysis task panicked: {e}")))?;
        let _ = tokio::fs::remove_file(&path).await;
        result
    }

    async fn download_segment(&self, url: &str) -> Result<Vec<u8>, WorkerError> {
        let resp = tokio::time::timeout(self.config.segment_fetch_timeout, self.http.get(url).send())
            .await
            .map_err(|_| WorkerError::Segment("segment fetch timed out".into()))?
            .map_err(|e| WorkerError::Segment(e.to_string()))?;

        if let Some(len) = resp.content_length() {
            if len > self.config.segment_max_bytes {
                return Err(WorkerError::Segment(format!("segment exceeds {} byte cap", self.config.segment_max_bytes)));
            }
        }

        let bytes = resp.bytes().await.map_err(|e| WorkerError::Segment(e.to_string()))?;
        if bytes.len() as u64 > self.config.segment_max_bytes {
            return Err(WorkerError::Segment(format!("segment exceeds {} byte cap", self.config.segment_max_bytes)));
        }
        Ok(bytes.to_vec())
    }

    /// Delivers a webhook to the operator's callback URL, then records
    /// the attempt as an audit event on a detached task (bounded at
    /// shutdown by `drain_audit_tasks`). Returns `Err` only when
    /// delivery itself is exhausted — the failure-policy signal.
    async fn emit(&mut self, event: WebhookEvent, data: serde_json::Value) -> Result<(), WorkerError> {
        self.emit_raw(event.as_str(), data).await
    }

    async fn emit_raw(&mut self, event_type: &'static str, data: serde_json::Value) -> Result<(), WorkerError> {
        let payload = WebhookPayload {
            event_type: event_type.to_string(),
            monitor_id: self.config.monitor_id.clone(),
            stream_url: self.config.stream_url.clone(),
            timestamp: Utc::now(),
            data,
            metadata: if self.config.metadata.is_null() { None } else { Some(self.config.metadata.clone()) },
        };

        let result = self
            .dispatcher
            .deliver(&self.config.callback_url, &self.config.webhook_signing_key, &payload)
            .await
            .map_err(WorkerError::Webhook)?;

        let status = if result.success { EventWebhookStatus::Sent } else { EventWebhookStatus::Failed };
        let control = Arc::clone(&self.control);
        let monitor_id = self.config.monitor_id.clone();
        let event_name = event_type.to_string();
        let audit_payload = serde_json::to_value(&payload).unwrap_or_default();
        self.audit_tasks.push(tokio::spawn(async move {
            if let Err(e) = control.record_event(&monitor_id, &event_name, audit_payload, status).await {
                warn!(monitor_id = %monitor_id, error = %e, "failed to record webhook audit event");
            }
        }));

        if !result.success {
            return Err(WorkerError::Webhook(stream_core::DispatchError::Exhausted {
                attempts: result.attempts,
                last_error: result.error.unwrap_or_default(),
            }));
        }
        Ok(())
    }

    async fn drain_audit_tasks(&mut self) {
        let tasks = std::mem::take(&mut self.audit_tasks);
        let _ = tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, futures::future::join_all(tasks)).await;
    }

    /// Sleeps for `interval` unless cancellation fires first; returns
    /// `false` when cancellation won the race so callers can bail out
    /// of their loop immediately.
    async fn sleep_or_cancel(interval: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => true,
            _ = cancel.changed() => !*cancel.borrow(),
        }
    }
}

