//! Test-only backend used by the API, orchestrator, and worker test
//! suites so none of them need a live Postgres instance.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stream_core::{Event, EventWebhookStatus, Monitor, MonitorStats, MonitorStatus, MonitorSummary};

use crate::error::RepositoryError;
use crate::repository::{ListFilter, Repository};

#[derive(Default)]
struct Inner {
    monitors: HashMap<String, Monitor>,
    stats: HashMap<String, MonitorStats>,
    events: HashMap<String, Event>,
    events_by_monitor: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create(&self, monitor: Monitor) -> Result<Monitor, RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if inner
            .monitors
            .values()
            .any(|m| m.stream_url == monitor.stream_url && m.status.is_active())
        {
            return Err(RepositoryError::DuplicateActiveMonitor(monitor.stream_url));
        }
        inner.stats.insert(monitor.id.clone(), MonitorStats::new(&monitor.id));
        inner.monitors.insert(monitor.id.clone(), monitor.clone());
        Ok(monitor)
    }

    async fn get_by_id(&self, id: &str) -> Result<Monitor, RepositoryError> {
        let inner = self.inner.read().expect("lock poisoned");
        inner
            .monitors
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn get_with_stats(&self, id: &str) -> Result<MonitorSummary, RepositoryError> {
        let inner = self.inner.read().expect("lock poisoned");
        let monitor = inner
            .monitors
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        let stats = inner
            .stats
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::StatsNotFound(id.to_string()))?;
        Ok(MonitorSummary { monitor, stats })
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<MonitorSummary>, RepositoryError> {
        let inner = self.inner.read().expect("lock poisoned");
        let mut items: Vec<MonitorSummary> = inner
            .monitors
            .values()
            .filter(|m| filter.status.is_none_or(|s| m.status == s))
            .filter_map(|m| {
                inner.stats.get(&m.id).map(|s| MonitorSummary {
                    monitor: m.clone(),
                    stats: s.clone(),
                })
            })
            .collect();
        items.sort_by(|a, b| b.monitor.created_at.cmp(&a.monitor.created_at));

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 { items.len() } else { filter.limit as usize };
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_status(&self, id: &str, status: MonitorStatus) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let monitor = inner
            .monitors
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        monitor.status = status;
        monitor.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status_with_condition(
        &self,
        id: &str,
        expected: MonitorStatus,
        new: MonitorStatus,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let monitor = inner
            .monitors
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        if monitor.status != expected {
            return Ok(false);
        }
        monitor.status = new;
        monitor.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_pod_name(&self, id: &str, pod_name: Option<&str>) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let monitor = inner
            .monitors
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        monitor.pod_name = pod_name.map(str::to_string);
        monitor.updated_at = Utc::now();
        Ok(())
    }

    async fn update_monitor(&self, monitor: Monitor) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if !inner.monitors.contains_key(&monitor.id) {
            return Err(RepositoryError::NotFound(monitor.id));
        }
        inner.monitors.insert(monitor.id.clone(), monitor);
        Ok(())
    }

    async fn update_stats(&self, stats: MonitorStats) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if !inner.monitors.contains_key(&stats.monitor_id) {
            return Err(RepositoryError::NotFound(stats.monitor_id));
        }
        inner.stats.insert(stats.monitor_id.clone(), stats);
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<Event, RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        inner
            .events_by_monitor
            .entry(event.monitor_id.clone())
            .or_default()
            .push(event.id.clone());
        inner.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn list_events(&self, monitor_id: &str, limit: i64) -> Result<Vec<Event>, RepositoryError> {
        let inner = self.inner.read().expect("lock poisoned");
        let mut events: Vec<Event> = inner
            .events_by_monitor
            .get(monitor_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.events.get(id).cloned())
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = if limit <= 0 { events.len() } else { limit as usize };
        events.truncate(limit);
        Ok(events)
    }

    async fn update_event_webhook_status(
        &self,
        event_id: &str,
        status: EventWebhookStatus,
        attempts: u32,
        last_error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let event = inner
            .events
            .get_mut(event_id)
            .ok_or_else(|| RepositoryError::NotFound(event_id.to_string()))?;
        event.webhook_status = status;
        event.webhook_attempts = attempts;
        event.webhook_last_error = last_error.map(str::to_string);
        event.sent_at = sent_at;
        Ok(())
    }

    async fn get_active_monitors(&self) -> Result<Vec<Monitor>, RepositoryError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .monitors
            .values()
            .filter(|m| m.status.is_active())
            .cloned()
            .collect())
    }

    async fn count_active_monitors(&self) -> Result<u64, RepositoryError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.monitors.values().filter(|m| m.status.is_active()).count() as u64)
    }

    async fn delete_stale_monitors(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        let stale: Vec<String> = inner
            .monitors
            .values()
            .filter(|m| m.status.is_terminal() && m.updated_at < cutoff)
            .map(|m| m.id.clone())
            .collect();
        for id in &stale {
            inner.monitors.remove(id);
            inner.stats.remove(id);
            if let Some(event_ids) = inner.events_by_monitor.remove(id) {
                for event_id in event_ids {
                    inner.events.remove(&event_id);
                }
            }
        }
        Ok(stale.len() as u64)
    }

    async fn delete_monitor(&self, id: &str) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        if inner.monitors.remove(id).is_none() {
            return Ok(false);
        }
        inner.stats.remove(id);
        if let Some(event_ids) = inner.events_by_monitor.remove(id) {
            for event_id in event_ids {
                inner.events.remove(&event_id);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_core::MonitorConfig;

    fn new_monitor(stream_url: &str) -> Monitor {
        let now = Utc::now();
        Monitor {
            id: Monitor::new_id(),
            stream_url: stream_url.to_string(),
            callback_url: "https://example.com/hook".to_string(),
            config: MonitorConfig::default(),
            metadata: serde_json::Value::Null,
            status: MonitorStatus::Initializing,
            pod_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_active_stream_url() {
        let repo = InMemoryRepository::new();
        repo.create(new_monitor("https://a.example/master.m3u8")).await.unwrap();
        let err = repo
            .create(new_monitor("https://a.example/master.m3u8"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateActiveMonitor(_)));
    }

    #[tokio::test]
    async fn conditional_status_update_is_single_winner() {
        let repo = InMemoryRepository::new();
        let monitor = repo.create(new_monitor("https://b.example/master.m3u8")).await.unwrap();
        repo.update_status(&monitor.id, MonitorStatus::Monitoring).await.unwrap();

        let first = repo
            .update_status_with_condition(&monitor.id, MonitorStatus::Monitoring, MonitorStatus::Error)
            .await
            .unwrap();
        let second = repo
            .update_status_with_condition(&monitor.id, MonitorStatus::Monitoring, MonitorStatus::Stopped)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(repo.get_by_id(&monitor.id).await.unwrap().status, MonitorStatus::Error);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_paginates() {
        let repo = InMemoryRepository::new();
        for i in 0..3 {
            repo.create(new_monitor(&format!("https://c.example/{i}.m3u8"))).await.unwrap();
        }
        let all = repo.list(ListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let page = repo
            .list(ListFilter { status: None, limit: 2, offset: 1 })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn delete_stale_monitors_only_removes_old_terminal_rows() {
        let repo = InMemoryRepository::new();
        let monitor = repo.create(new_monitor("https://d.example/x.m3u8")).await.unwrap();
        repo.update_status(&monitor.id, MonitorStatus::Completed).await.unwrap();

        let removed = repo.delete_stale_monitors(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 0);

        let removed = repo.delete_stale_monitors(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(repo.get_by_id(&monitor.id).await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_monitor_is_idempotent() {
        let repo = InMemoryRepository::new();
        let monitor = repo.create(new_monitor("https://e.example/x.m3u8")).await.unwrap();

        assert!(repo.delete_monitor(&monitor.id).await.unwrap());
        assert!(matches!(repo.get_by_id(&monitor.id).await, Err(RepositoryError::NotFound(_))));
        assert!(!repo.delete_monitor(&monitor.id).await.unwrap());
    }
}
