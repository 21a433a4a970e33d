//! Public `/api/v1/monitors` surface: create/list/get/patch/delete plus
//! the per-monitor audit event feed.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use stream_core::{validate_outbound_url, Event, Health, Monitor, MonitorConfig, MonitorStatus, StreamStatus};

use crate::error::ApiError;
use crate::state::AppState;
use crate::validate::{is_absolute_http_url, is_valid_stream_url};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/monitors", post(create_monitor).get(list_monitors))
        .route("/monitors/{id}", get(get_monitor).patch(patch_monitor).delete(delete_monitor))
        .route("/monitors/{id}/events", get(list_events))
}

fn parse_status_param(s: &str) -> Result<MonitorStatus, ApiError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| ApiError::ValidationError(format!("invalid status filter: {s}")))
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(l) if l > 0 => l.min(MAX_LIMIT),
        _ => DEFAULT_LIMIT,
    }
}

#[derive(Deserialize, Default)]
pub struct MonitorConfigInput {
    pub check_interval_sec: Option<u64>,
    pub blackout_threshold_sec: Option<u64>,
    pub silence_threshold_sec: Option<u64>,
    pub silence_db_threshold: Option<f64>,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub start_delay_tolerance_sec: Option<u64>,
}

impl MonitorConfigInput {
    fn into_monitor_config(self) -> MonitorConfig {
        let mut c = MonitorConfig::default();
        if let Some(v) = self.check_interval_sec {
            c = c.with_check_interval_sec(v);
        }
        if let Some(v) = self.blackout_threshold_sec {
            c = c.with_blackout_threshold_sec(v);
        }
        if let Some(v) = self.silence_threshold_sec {
            c = c.with_silence_threshold_sec(v);
        }
        if let Some(v) = self.silence_db_threshold {
            c = c.with_silence_db_threshold(v);
        }
        if self.scheduled_start_time.is_some() {
            c = c.with_scheduled_start_time(self.scheduled_start_time);
        }
        if let Some(v) = self.start_delay_tolerance_sec {
            c = c.with_start_delay_tolerance_sec(v);
        }
        c
    }

    fn apply_patch(self, base: &mut MonitorConfig) {
        if let Some(v) = self.check_interval_sec {
            base.check_interval_sec = v;
        }
        if let Some(v) = self.blackout_threshold_sec {
            base.blackout_threshold_sec = v;
        }
        if let Some(v) = self.silence_threshold_sec {
            base.silence_threshold_sec = v;
        }
        if let Some(v) = self.silence_db_threshold {
            base.silence_db_threshold = v;
        }
        if self.scheduled_start_time.is_some() {
            base.scheduled_start_time = self.scheduled_start_time;
        }
        if let Some(v) = self.start_delay_tolerance_sec {
            base.start_delay_tolerance_sec = v;
        }
    }
}

#[derive(Deserialize)]
pub struct CreateMonitorRequest {
    pub stream_url: String,
    pub callback_url: String,
    #[serde(default)]
    pub config: Option<MonitorConfigInput>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct CreateMonitorResponse {
    pub monitor_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct Pagination {
    pub total: u64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Serialize)]
pub struct MonitorSummaryView {
    pub monitor_id: String,
    pub stream_url: String,
    pub status: String,
    pub stream_status: StreamStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct ListMonitorsResponse {
    pub monitors: Vec<MonitorSummaryView>,
    pub pagination: Pagination,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct StatisticsView {
    pub total_segments: u64,
    pub blackout_events: u64,
    pub silence_events: u64,
}

#[derive(Serialize)]
pub struct HealthView {
    pub video: Health,
    pub audio: Health,
}

#[derive(Serialize)]
pub struct MonitorDetailResponse {
    pub monitor_id: String,
    pub stream_url: String,
    pub status: String,
    pub stream_status: StreamStatus,
    pub health: HealthView,
    pub statistics: StatisticsView,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct PatchMonitorRequest {
    pub callback_url: Option<String>,
    pub config: Option<MonitorConfigInput>,
}

#[derive(Serialize)]
pub struct DeleteMonitorResponse {
    pub monitor_id: String,
    pub status: &'static str,
    pub stopped_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub monitor_id: String,
    pub events: Vec<Event>,
    pub pagination: Pagination,
}

/// POST /api/v1/monitors
async fn create_monitor(
    State(state): State<AppState>,
    Json(body): Json<CreateMonitorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_valid_stream_url(&body.stream_url) {
        return Err(ApiError::InvalidUrl(format!("unsupported stream URL: {}", body.stream_url)));
    }
    if !is_absolute_http_url(&body.callback_url) {
        return Err(ApiError::InvalidUrl(format!(
            "callback_url must be an absolute http(s) URL: {}",
            body.callback_url
        )));
    }
    validate_outbound_url(&body.callback_url, state.config.allow_private_callbacks)
        .await
        .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

    let config = body.config.unwrap_or_default().into_monitor_config();
    config.validate().map_err(ApiError::InvalidConfig)?;

    let active = state.repo.count_active_monitors().await?;
    if active >= state.config.max_monitors {
        return Err(ApiError::MaxMonitorsExceeded);
    }

    let now = Utc::now();
    let monitor = Monitor {
        id: Monitor::new_id(),
        stream_url: body.stream_url,
        callback_url: body.callback_url,
        config,
        metadata: body.metadata.unwrap_or(serde_json::Value::Null),
        status: MonitorStatus::Initializing,
        pod_name: None,
        created_at: now,
        updated_at: now,
    };

    let monitor = state.repo.create(monitor).await?;

    if let Err(e) = state.reconciler.create_worker_for(&monitor).await {
        warn!(monitor_id = %monitor.id, error = %e, "worker creation failed for newly admitted monitor");
        let _ = state.repo.update_status(&monitor.id, MonitorStatus::Error).await;
        return Err(ApiError::Kubernetes(e.to_string()));
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateMonitorResponse {
            monitor_id: monitor.id,
            status: monitor.status.to_string(),
            created_at: monitor.created_at,
        }),
    ))
}

/// GET /api/v1/monitors
async fn list_monitors(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListMonitorsResponse>, ApiError> {
    let status = q.status.as_deref().map(parse_status_param).transpose()?;
    let limit = clamp_limit(q.limit);
    let offset = q.offset.unwrap_or(0).max(0);

    let total = state
        .repo
        .list(stream_store::ListFilter { status, limit: 0, offset: 0 })
        .await?
        .len() as u64;
    let page = state.repo.list(stream_store::ListFilter { status, limit, offset }).await?;

    let monitors = page
        .into_iter()
        .map(|s| MonitorSummaryView {
            monitor_id: s.monitor.id,
            stream_url: s.monitor.stream_url,
            status: s.monitor.status.to_string(),
            stream_status: s.stats.stream_status,
            created_at: s.monitor.created_at,
        })
        .collect();

    Ok(Json(ListMonitorsResponse {
        monitors,
        pagination: Pagination { total, limit, offset },
    }))
}

/// GET /api/v1/monitors/:id
async fn get_monitor(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MonitorDetailResponse>, ApiError> {
    let summary = state.repo.get_with_stats(&id).await?;
    Ok(Json(MonitorDetailResponse {
        monitor_id: summary.monitor.id,
        stream_url: summary.monitor.stream_url,
        status: summary.monitor.status.to_string(),
        stream_status: summary.stats.stream_status,
        health: HealthView {
            video: summary.stats.video_health,
            audio: summary.stats.audio_health,
        },
        statistics: StatisticsView {
            total_segments: summary.stats.total_segments,
            blackout_events: summary.stats.blackout_events,
            silence_events: summary.stats.silence_events,
        },
        created_at: summary.monitor.created_at,
    }))
}

/// PATCH /api/v1/monitors/:id
async fn patch_monitor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchMonitorRequest>,
) -> Result<Json<MonitorDetailResponse>, ApiError> {
    let mut monitor = state.repo.get_by_id(&id).await?;
    if monitor.status.is_terminal() {
        return Err(ApiError::MonitorNotActive(format!("monitor {id} is not active")));
    }

    if let Some(callback_url) = body.callback_url {
        if !is_absolute_http_url(&callback_url) {
            return Err(ApiError::InvalidUrl(format!("callback_url must be an absolute http(s) URL: {callback_url}")));
        }
        validate_outbound_url(&callback_url, state.config.allow_private_callbacks)
            .await
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        monitor.callback_url = callback_url;
    }
    if let Some(config_patch) = body.config {
        config_patch.apply_patch(&mut monitor.config);
        monitor.config.validate().map_err(ApiError::InvalidConfig)?;
    }
    monitor.updated_at = Utc::now();

    state.repo.update_monitor(monitor.clone()).await?;
    let stats = state.repo.get_with_stats(&id).await?.stats;

    Ok(Json(MonitorDetailResponse {
        monitor_id: monitor.id,
        stream_url: monitor.stream_url,
        status: monitor.status.to_string(),
        stream_status: stats.stream_status,
        health: HealthView { video: stats.video_health, audio: stats.audio_health },
        statistics: StatisticsView {
            total_segments: stats.total_segments,
            blackout_events: stats.blackout_events,
            silence_events: stats.silence_events,
        },
        created_at: monitor.created_at,
    }))
}

/// DELETE /api/v1/monitors/:id
async fn delete_monitor(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DeleteMonitorResponse>, ApiError> {
    let monitor = state.repo.get_by_id(&id).await?;
    state.repo.update_status(&id, MonitorStatus::Stopped).await?;

    if let Err(e) = state.reconciler.delete_worker_for(&monitor.id).await {
        warn!(monitor_id = %id, error = %e, "best-effort worker removal failed after stop; reconciler will clean it up as a zombie");
    }

    Ok(Json(DeleteMonitorResponse {
        monitor_id: id,
        status: "stopped",
        stopped_at: Utc::now(),
    }))
}

/// GET /api/v1/monitors/:id/events
async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ListQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    state.repo.get_by_id(&id).await?;

    let all = state.repo.list_events(&id, 0).await?;
    let total = all.len() as u64;
    let limit = clamp_limit(q.limit);
    let offset = q.offset.unwrap_or(0).max(0) as usize;
    let events = all.into_iter().skip(offset).take(limit as usize).collect();

    Ok(Json(EventsResponse {
        monitor_id: id,
        events,
        pagination: Pagination { total, limit, offset: offset as i64 },
    }))
}
