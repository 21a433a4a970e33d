//! Postgres-backed `Repository`. Deliberately uses runtime `query`/
//! `query_as` with `.bind()` rather than the `query!` compile-time macro:
//! the macro needs a live `DATABASE_URL` (or an offline query cache) at
//! build time, which this binary's deployment story doesn't assume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use stream_core::{Event, EventWebhookStatus, Health, Monitor, MonitorStats, MonitorStatus, MonitorSummary, StreamStatus};

use crate::error::RepositoryError;
use crate::repository::{ListFilter, Repository};

#[derive(FromRow)]
struct MonitorRow {
    id: String,
    stream_url: String,
    callback_url: String,
    config: serde_json::Value,
    metadata: serde_json::Value,
    status: String,
    pod_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MonitorRow {
    fn into_monitor(self) -> Result<Monitor, RepositoryError> {
        Ok(Monitor {
            id: self.id,
            stream_url: self.stream_url,
            callback_url: self.callback_url,
            config: serde_json::from_value(self.config).map_err(|e| RepositoryError::Backend(sqlx::Error::Decode(Box::new(e))))?,
            metadata: self.metadata,
            status: parse_status(&self.status)?,
            pod_name: self.pod_name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct StatsRow {
    monitor_id: String,
    total_segments: i64,
    blackout_events: i64,
    silence_events: i64,
    last_check_at: Option<DateTime<Utc>>,
    video_health: String,
    audio_health: String,
    stream_status: String,
}

impl StatsRow {
    fn into_stats(self) -> Result<MonitorStats, RepositoryError> {
        Ok(MonitorStats {
            monitor_id: self.monitor_id,
            total_segments: self.total_segments as u64,
            blackout_events: self.blackout_events as u64,
            silence_events: self.silence_events as u64,
            last_check_at: self.last_check_at,
            video_health: parse_health(&self.video_health)?,
            audio_health: parse_health(&self.audio_health)?,
            stream_status: parse_stream_status(&self.stream_status)?,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: String,
    monitor_id: String,
    event_type: String,
    payload: serde_json::Value,
    webhook_status: String,
    webhook_attempts: i32,
    webhook_last_error: Option<String>,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl EventRow {
    fn into_event(self) -> Result<Event, RepositoryError> {
        Ok(Event {
            id: self.id,
            monitor_id: self.monitor_id,
            event_type: self.event_type,
            payload: self.payload,
            webhook_status: parse_webhook_status(&self.webhook_status)?,
            webhook_attempts: self.webhook_attempts as u32,
            webhook_last_error: self.webhook_last_error,
            created_at: self.created_at,
            sent_at: self.sent_at,
        })
    }
}

fn parse_status(s: &str) -> Result<MonitorStatus, RepositoryError> {
    match s {
        "initializing" => Ok(MonitorStatus::Initializing),
        "waiting" => Ok(MonitorStatus::Waiting),
        "monitoring" => Ok(MonitorStatus::Monitoring),
        "completed" => Ok(MonitorStatus::Completed),
        "stopped" => Ok(MonitorStatus::Stopped),
        "error" => Ok(MonitorStatus::Error),
        other => Err(RepositoryError::Backend(sqlx::Error::Decode(format!("unknown monitor status: {other}").into()))),
    }
}

fn parse_health(s: &str) -> Result<Health, RepositoryError> {
    match s {
        "ok" => Ok(Health::Ok),
        "warning" => Ok(Health::Warning),
        "error" => Ok(Health::Error),
        "unknown" => Ok(Health::Unknown),
        other => Err(RepositoryError::Backend(sqlx::Error::Decode(format!("unknown health: {other}").into()))),
    }
}

fn parse_stream_status(s: &str) -> Result<StreamStatus, RepositoryError> {
    match s {
        "unknown" => Ok(StreamStatus::Unknown),
        "scheduled" => Ok(StreamStatus::Scheduled),
        "live" => Ok(StreamStatus::Live),
        "ended" => Ok(StreamStatus::Ended),
        other => Err(RepositoryError::Backend(sqlx::Error::Decode(format!("unknown stream status: {other}").into()))),
    }
}

fn parse_webhook_status(s: &str) -> Result<EventWebhookStatus, RepositoryError> {
    match s {
        "pending" => Ok(EventWebhookStatus::Pending),
        "sent" => Ok(EventWebhookStatus::Sent),
        "failed" => Ok(EventWebhookStatus::Failed),
        other => Err(RepositoryError::Backend(sqlx::Error::Decode(format!("unknown webhook status: {other}").into()))),
    }
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn create(&self, monitor: Monitor) -> Result<Monitor, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let existing_active: i64 = sqlx::query(
            "SELECT COUNT(*) FROM monitors WHERE stream_url = $1 AND status IN ('initializing','waiting','monitoring')",
        )
        .bind(&monitor.stream_url)
        .fetch_one(&mut *tx)
        .await?
        .try_get(0)?;
        if existing_active > 0 {
            return Err(RepositoryError::DuplicateActiveMonitor(monitor.stream_url));
        }

        sqlx::query(
            "INSERT INTO monitors (id, stream_url, callback_url, config, metadata, status, pod_name, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&monitor.id)
        .bind(&monitor.stream_url)
        .bind(&monitor.callback_url)
        .bind(serde_json::to_value(&monitor.config).map_err(|e| RepositoryError::Backend(sqlx::Error::Encode(Box::new(e))))?)
        .bind(&monitor.metadata)
        .bind(monitor.status.to_string())
        .bind(&monitor.pod_name)
        .bind(monitor.created_at)
        .bind(monitor.updated_at)
        .execute(&mut *tx)
        .await?;

        let stats = MonitorStats::new(&monitor.id);
        sqlx::query(
            "INSERT INTO monitor_stats (monitor_id, total_segments, blackout_events, silence_events, last_check_at, video_health, audio_health, stream_status)
             VALUES ($1, 0, 0, 0, NULL, 'unknown', 'unknown', 'unknown')",
        )
        .bind(&stats.monitor_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(monitor)
    }

    async fn get_by_id(&self, id: &str) -> Result<Monitor, RepositoryError> {
        let row: Option<MonitorRow> = sqlx::query_as(
            "SELECT id, stream_url, callback_url, config, metadata, status, pod_name, created_at, updated_at FROM monitors WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| RepositoryError::NotFound(id.to_string()))?.into_monitor()
    }

    async fn get_with_stats(&self, id: &str) -> Result<MonitorSummary, RepositoryError> {
        let monitor = self.get_by_id(id).await?;
        let row: Option<StatsRow> = sqlx::query_as(
            "SELECT monitor_id, total_segments, blackout_events, silence_events, last_check_at, video_health, audio_health, stream_status
             FROM monitor_stats WHERE monitor_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let stats = row.ok_or_else(|| RepositoryError::StatsNotFound(id.to_string()))?.into_stats()?;
        Ok(MonitorSummary { monitor, stats })
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<MonitorSummary>, RepositoryError> {
        let limit = if filter.limit <= 0 { 100 } else { filter.limit };
        let rows: Vec<MonitorRow> = if let Some(status) = filter.status {
            sqlx::query_as(
                "SELECT id, stream_url, callback_url, config, metadata, status, pod_name, created_at, updated_at
                 FROM monitors WHERE status = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(status.to_string())
            .bind(limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT id, stream_url, callback_url, config, metadata, status, pod_name, created_at, updated_at
                 FROM monitors ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let monitor = row.into_monitor()?;
            let stats_row: Option<StatsRow> = sqlx::query_as(
                "SELECT monitor_id, total_segments, blackout_events, silence_events, last_check_at, video_health, audio_health, stream_status
                 FROM monitor_stats WHERE monitor_id = $1",
            )
            .bind(&monitor.id)
            .fetch_optional(&self.pool)
            .await?;
            let Some(stats_row) = stats_row else { continue };
            out.push(MonitorSummary { monitor, stats: stats_row.into_stats()? });
        }
        Ok(out)
    }

    async fn update_status(&self, id: &str, status: MonitorStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE monitors SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_status_with_condition(
        &self,
        id: &str,
        expected: MonitorStatus,
        new: MonitorStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE monitors SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
        )
        .bind(new.to_string())
        .bind(id)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_pod_name(&self, id: &str, pod_name: Option<&str>) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE monitors SET pod_name = $1, updated_at = now() WHERE id = $2")
            .bind(pod_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_monitor(&self, monitor: Monitor) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE monitors SET stream_url = $1, callback_url = $2, config = $3, metadata = $4, status = $5, pod_name = $6, updated_at = now()
             WHERE id = $7",
        )
        .bind(&monitor.stream_url)
        .bind(&monitor.callback_url)
        .bind(serde_json::to_value(&monitor.config).map_err(|e| RepositoryError::Backend(sqlx::Error::Encode(Box::new(e))))?)
        .bind(&monitor.metadata)
        .bind(monitor.status.to_string())
        .bind(&monitor.pod_name)
        .bind(&monitor.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(monitor.id));
        }
        Ok(())
    }

    async fn update_stats(&self, stats: MonitorStats) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE monitor_stats SET total_segments = $1, blackout_events = $2, silence_events = $3, last_check_at = $4,
             video_health = $5, audio_health = $6, stream_status = $7 WHERE monitor_id = $8",
        )
        .bind(stats.total_segments as i64)
        .bind(stats.blackout_events as i64)
        .bind(stats.silence_events as i64)
        .bind(stats.last_check_at)
        .bind(health_str(stats.video_health))
        .bind(health_str(stats.audio_health))
        .bind(stream_status_str(stats.stream_status))
        .bind(&stats.monitor_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(stats.monitor_id));
        }
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<Event, RepositoryError> {
        sqlx::query(
            "INSERT INTO events (id, monitor_id, event_type, payload, webhook_status, webhook_attempts, webhook_last_error, created_at, sent_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&event.id)
        .bind(&event.monitor_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(webhook_status_str(event.webhook_status))
        .bind(event.webhook_attempts as i32)
        .bind(&event.webhook_last_error)
        .bind(event.created_at)
        .bind(event.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    async fn list_events(&self, monitor_id: &str, limit: i64) -> Result<Vec<Event>, RepositoryError> {
        let limit = if limit <= 0 { 100 } else { limit };
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, monitor_id, event_type, payload, webhook_status, webhook_attempts, webhook_last_error, created_at, sent_at
             FROM events WHERE monitor_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(monitor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }

    async fn update_event_webhook_status(
        &self,
        event_id: &str,
        status: EventWebhookStatus,
        attempts: u32,
        last_error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE events SET webhook_status = $1, webhook_attempts = $2, webhook_last_error = $3, sent_at = $4 WHERE id = $5",
        )
        .bind(webhook_status_str(status))
        .bind(attempts as i32)
        .bind(last_error)
        .bind(sent_at)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    async fn get_active_monitors(&self) -> Result<Vec<Monitor>, RepositoryError> {
        let rows: Vec<MonitorRow> = sqlx::query_as(
            "SELECT id, stream_url, callback_url, config, metadata, status, pod_name, created_at, updated_at
             FROM monitors WHERE status IN ('initializing','waiting','monitoring')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MonitorRow::into_monitor).collect()
    }

    async fn count_active_monitors(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) FROM monitors WHERE status IN ('initializing','waiting','monitoring')")
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count as u64)
    }

    async fn delete_stale_monitors(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM monitors WHERE status IN ('completed','stopped','error') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_monitor(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM monitors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn health_str(h: Health) -> &'static str {
    match h {
        Health::Ok => "ok",
        Health::Warning => "warning",
        Health::Error => "error",
        Health::Unknown => "unknown",
    }
}

fn stream_status_str(s: StreamStatus) -> &'static str {
    match s {
        StreamStatus::Unknown => "unknown",
        StreamStatus::Scheduled => "scheduled",
        StreamStatus::Live => "live",
        StreamStatus::Ended => "ended",
    }
}

fn webhook_status_str(s: EventWebhookStatus) -> &'static str {
    match s {
        EventWebhookStatus::Pending => "pending",
        EventWebhookStatus::Sent => "sent",
        EventWebhookStatus::Failed => "failed",
    }
}

/// Applies the schema migration on startup; idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(include_str!("../migrations/0001_init.sql")).execute(pool).await?;
    Ok(())
}
