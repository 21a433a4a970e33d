use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stream_core::{Event, EventWebhookStatus, Monitor, MonitorStats, MonitorStatus, MonitorSummary};

use crate::error::RepositoryError;

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<MonitorStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Durable store of `Monitor`/`MonitorStats`/`Event`. Every mutation that
/// touches `status` goes through `update_status` or
/// `update_status_with_condition` — never a blind field write — so the
/// reconciler and the worker never race each other into an inconsistent
/// status.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create(&self, monitor: Monitor) -> Result<Monitor, RepositoryError>;

    async fn get_by_id(&self, id: &str) -> Result<Monitor, RepositoryError>;

    async fn get_with_stats(&self, id: &str) -> Result<MonitorSummary, RepositoryError>;

    async fn list(&self, filter: ListFilter) -> Result<Vec<MonitorSummary>, RepositoryError>;

    async fn update_status(&self, id: &str, status: MonitorStatus) -> Result<(), RepositoryError>;

    /// Applies the status transition only if the stored status still
    /// equals `expected`; returns whether it applied. Used by the pod
    /// failure watcher and the reconciler so exactly one writer wins a
    /// race over the same monitor.
    async fn update_status_with_condition(
        &self,
        id: &str,
        expected: MonitorStatus,
        new: MonitorStatus,
    ) -> Result<bool, RepositoryError>;

    async fn update_pod_name(&self, id: &str, pod_name: Option<&str>) -> Result<(), RepositoryError>;

    async fn update_monitor(&self, monitor: Monitor) -> Result<(), RepositoryError>;

    async fn update_stats(&self, stats: MonitorStats) -> Result<(), RepositoryError>;

    async fn create_event(&self, event: Event) -> Result<Event, RepositoryError>;

    async fn list_events(&self, monitor_id: &str, limit: i64) -> Result<Vec<Event>, RepositoryError>;

    async fn update_event_webhook_status(
        &self,
        event_id: &str,
        status: EventWebhookStatus,
        attempts: u32,
        last_error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;

    async fn get_active_monitors(&self) -> Result<Vec<Monitor>, RepositoryError>;

    async fn count_active_monitors(&self) -> Result<u64, RepositoryError>;

    /// Deletes terminal monitors whose `updated_at` is older than `cutoff`.
    /// Returns the number of rows removed.
    async fn delete_stale_monitors(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;

    /// Deletes a single monitor row (and its stats/events) regardless of
    /// status. Returns whether a row was actually found and removed, so
    /// callers can treat a repeat delete as an idempotent no-op.
    async fn delete_monitor(&self, id: &str) -> Result<bool, RepositoryError>;
}
