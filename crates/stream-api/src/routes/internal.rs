//! Worker-facing `/internal/v1` surface: status heartbeat, terminate,
//! and audit-event recording. Authenticated by a separate internal key
//! and never rate-limited.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use stream_core::{Event, EventWebhookStatus, Health, MonitorStatus, StreamStatus};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/monitors/{id}/status", put(update_status))
        .route("/monitors/{id}/terminate", post(terminate))
        .route("/monitors/{id}/events", post(record_event))
}

#[derive(Deserialize)]
pub struct HealthInput {
    pub video: Health,
    pub audio: Health,
}

#[derive(Deserialize)]
pub struct StatisticsInput {
    pub total_segments: Option<u64>,
    pub blackout_events: Option<u64>,
    pub silence_events: Option<u64>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: MonitorStatus,
    pub stream_status: Option<StreamStatus>,
    pub health: Option<HealthInput>,
    pub statistics: Option<StatisticsInput>,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// PUT /internal/v1/monitors/:id/status
///
/// Every enum field is already validated by `serde` before this handler
/// runs — an unparseable status/health/stream_status value fails the
/// JSON extraction itself, so no partial write is ever possible here.
async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let current = state.repo.get_by_id(&id).await?;
    if current.status.is_terminal() {
        return Err(ApiError::MonitorNotActive(format!("monitor {id} is not active")));
    }

    if current.status != body.status {
        state.repo.update_status(&id, body.status).await?;
    }

    if body.stream_status.is_some() || body.health.is_some() || body.statistics.is_some() {
        let mut stats = state.repo.get_with_stats(&id).await?.stats;
        if let Some(s) = body.stream_status {
            stats.stream_status = s;
        }
        if let Some(h) = body.health {
            stats.video_health = h.video;
            stats.audio_health = h.audio;
        }
        if let Some(s) = body.statistics {
            if let Some(v) = s.total_segments {
                stats.total_segments = v;
            }
            if let Some(v) = s.blackout_events {
                stats.blackout_events = v;
            }
            if let Some(v) = s.silence_events {
                stats.silence_events = v;
            }
        }
        stats.last_check_at = Some(chrono::Utc::now());
        state.repo.update_stats(stats).await?;
    }

    Ok(Json(MessageResponse { message: "status updated".into() }))
}

#[derive(Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct TerminateResponse {
    pub deleted: bool,
}

/// POST /internal/v1/monitors/:id/terminate
///
/// Deletes the monitor row outright. Terminating an already-deleted
/// monitor is reported as success with `deleted:false` rather than 404 —
/// the worker's self-destruct call must be idempotent against a racing
/// reconciler cleanup.
async fn terminate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TerminateRequest>,
) -> Result<Json<TerminateResponse>, ApiError> {
    tracing::info!(monitor_id = %id, reason = ?body.reason, "worker requested self-terminate");

    if let Err(e) = state.reconciler.delete_worker_for(&id).await {
        tracing::warn!(monitor_id = %id, error = %e, "worker self-terminate could not remove its own pod");
    }

    let deleted = state.repo.delete_monitor(&id).await?;
    Ok(Json(TerminateResponse { deleted }))
}

#[derive(Deserialize)]
pub struct RecordEventRequest {
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub webhook_status: Option<EventWebhookStatus>,
}

/// POST /internal/v1/monitors/:id/events
async fn record_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RecordEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.repo.get_by_id(&id).await?;

    let mut event = Event::new(id, body.event_type, body.payload);
    if let Some(status) = body.webhook_status {
        event.webhook_status = status;
        if status == EventWebhookStatus::Sent {
            event.sent_at = Some(chrono::Utc::now());
        }
    }
    let created = state.repo.create_event(event).await?;
    Ok(Json(created))
}
