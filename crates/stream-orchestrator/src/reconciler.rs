//! Periodic desired-vs-observed convergence: compares active monitors in
//! the repository against worker pods actually running in the cluster
//! and repairs drift in either direction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::warn;

use stream_core::{Event, EventWebhookStatus, Monitor, MonitorStatus, WebhookDispatcher, WebhookEvent, WebhookPayload};
use stream_store::Repository;

use crate::pod_manager::{PodManager, WorkerPodSpec};

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    /// Active monitors with no worker pod; each was flipped to `error`
    /// and a `monitor.error` webhook was emitted for it. No pod is ever
    /// created here — admission is the only path that creates one.
    pub missing_flagged: Vec<String>,
    /// Pods whose monitor is terminal or deleted; the pod was removed.
    pub zombies_deleted: Vec<String>,
    /// Pods whose monitor-id label resolves to no known monitor at all.
    pub orphans_deleted: Vec<String>,
    pub errors: Vec<String>,
}

pub struct Reconciler<R: ?Sized, P: ?Sized> {
    sweep_timeout: Duration,
    internal_base_url: String,
    operator_webhook_url: Option<String>,
    webhook_signing_key: String,
    repo: Arc<R>,
    pods: Arc<P>,
    dispatcher: Arc<WebhookDispatcher>,
}

impl<R, P> Reconciler<R, P>
where
    R: Repository + ?Sized + 'static,
    P: PodManager + ?Sized + 'static,
{
    pub fn new(repo: Arc<R>, pods: Arc<P>, dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self {
            repo,
            pods,
            dispatcher,
            sweep_timeout: Duration::from_secs(30),
            internal_base_url: String::new(),
            operator_webhook_url: None,
            webhook_signing_key: String::new(),
        }
    }

    pub fn with_sweep_timeout(mut self, timeout: Duration) -> Self {
        self.sweep_timeout = timeout;
        self
    }

    /// The cluster-internal Gateway base URL workers call for their
    /// status heartbeat, terminate, and event-recording calls — never
    /// the operator-supplied `callback_url`.
    pub fn with_internal_base_url(mut self, url: impl Into<String>) -> Self {
        self.internal_base_url = url.into();
        self
    }

    /// Second sink for `monitor.error` webhooks, alongside the affected
    /// monitor's own `callback_url`. `None` when the operator hasn't
    /// configured one.
    pub fn with_operator_webhook_url(mut self, url: Option<String>) -> Self {
        self.operator_webhook_url = url;
        self
    }

    pub fn with_webhook_signing_key(mut self, key: impl Into<String>) -> Self {
        self.webhook_signing_key = key.into();
        self
    }

    fn worker_spec(&self, monitor: &Monitor) -> WorkerPodSpec {
        WorkerPodSpec {
            monitor_id: monitor.id.clone(),
            stream_url: monitor.stream_url.clone(),
            callback_url: monitor.callback_url.clone(),
            control_plane_url: self.internal_base_url.clone(),
            extra_env: Vec::new(),
        }
    }

    /// Synchronous counterpart to the sweep's "missing" repair, used by
    /// ControlAPI right after a monitor is admitted.
    pub async fn create_worker_for(
        &self,
        monitor: &Monitor,
    ) -> Result<crate::pod_manager::WorkerPodInfo, crate::error::PodManagerError> {
        let info = self.pods.create_worker(self.worker_spec(monitor)).await?;

        if let Err(e) = self.repo.update_pod_name(&monitor.id, Some(&info.pod_name)).await {
            warn!(monitor_id = %monitor.id, error = %e, "created worker pod but failed to persist pod_name");
        }

        Ok(info)
    }

    /// Best-effort worker removal for an explicit stop; the DB mutation
    /// (`status = stopped`) is authoritative regardless of whether this
    /// succeeds — a surviving pod is cleaned up as a zombie on the next
    /// sweep either way.
    pub async fn delete_worker_for(&self, monitor_id: &str) -> Result<(), crate::error::PodManagerError> {
        self.pods.delete_worker(monitor_id).await
    }

    pub async fn sweep(&self) -> ReconcileReport {
        match tokio::time::timeout(self.sweep_timeout, self.sweep_inner()).await {
            Ok(report) => report,
            Err(_) => {
                warn!("reconcile sweep exceeded its bounded timeout; partial results discarded");
                ReconcileReport {
                    errors: vec!["sweep timed out".to_string()],
                    ..Default::default()
                }
            }
        }
    }

    async fn sweep_inner(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let active_monitors = match self.repo.get_active_monitors().await {
            Ok(m) => m,
            Err(e) => {
                report.errors.push(format!("failed to list active monitors: {e}"));
                return report;
            }
        };

        let (pods, _resource_version) = match self.pods.list_workers().await {
            Ok(p) => p,
            Err(e) => {
                report.errors.push(format!("failed to list worker pods: {e}"));
                return report;
            }
        };

        let pod_by_monitor: std::collections::HashMap<&str, &crate::pod_manager::WorkerPodInfo> =
            pods.iter().map(|p| (p.monitor_id.as_str(), p)).collect();

        for monitor in &active_monitors {
            if pod_by_monitor.contains_key(monitor.id.as_str()) {
                continue;
            }

            match self.repo.update_status_with_condition(&monitor.id, monitor.status, MonitorStatus::Error).await {
                Ok(true) => {
                    warn!(monitor_id = %monitor.id, "reconciler flipped monitor to error: active monitor has no worker pod");
                    self.emit_reconciliation_mismatch(monitor).await;
                    report.missing_flagged.push(monitor.id.clone());
                }
                Ok(false) => {
                    // Status moved since the snapshot (e.g. the worker
                    // self-terminated in the same window); another writer
                    // already won, nothing left for this sweep to do.
                }
                Err(e) => report.errors.push(format!("failed to flag missing worker for {}: {e}", monitor.id)),
            }
        }

        let active_ids: std::collections::HashSet<&str> = active_monitors.iter().map(|m| m.id.as_str()).collect();

        for pod in &pods {
            if pod.monitor_id.is_empty() {
                continue;
            }
            if active_ids.contains(pod.monitor_id.as_str()) {
                continue;
            }

            match self.repo.get_by_id(&pod.monitor_id).await {
                Ok(monitor) if monitor.status.is_terminal() => {
                    self.delete_pod(&pod.monitor_id, &mut report.zombies_deleted, &mut report.errors).await;
                }
                Ok(_) => {
                    // Active per a stale read above; re-checked here, skip.
                }
                Err(_) => {
                    self.delete_pod(&pod.monitor_id, &mut report.orphans_deleted, &mut report.errors).await;
                }
            }
        }

        report
    }

    async fn delete_pod(&self, monitor_id: &str, bucket: &mut Vec<String>, errors: &mut Vec<String>) {
        match self.pods.delete_worker(monitor_id).await {
            Ok(()) => bucket.push(monitor_id.to_string()),
            Err(e) => errors.push(format!("failed to delete pod for {monitor_id}: {e}")),
        }
    }

    /// Emits a `monitor.error` webhook for a monitor this sweep just
    /// flipped to `error`, to the operator sink (if configured) and to
    /// the monitor's own `callback_url`. Only the latter attempt is
    /// recorded as an audit event — the operator sink is a side channel,
    /// not part of this monitor's event history.
    async fn emit_reconciliation_mismatch(&self, monitor: &Monitor) {
        let data = json!({ "reason": "reconciliation_mismatch" });
        let metadata = if monitor.metadata.is_null() { None } else { Some(monitor.metadata.clone()) };
        let payload = WebhookPayload::new(WebhookEvent::MonitorError, monitor.id.clone(), monitor.stream_url.clone(), data, metadata);

        if let Some(operator_url) = &self.operator_webhook_url {
            match self.dispatcher.deliver(operator_url, &self.webhook_signing_key, &payload).await {
                Ok(result) if !result.success => {
                    warn!(monitor_id = %monitor.id, error = ?result.error, "operator webhook delivery failed for monitor.error");
                }
                Err(e) => warn!(monitor_id = %monitor.id, error = %e, "operator webhook dispatch error"),
                _ => {}
            }
        }

        let delivery = self.dispatcher.deliver(&monitor.callback_url, &self.webhook_signing_key, &payload).await;
        let (status, attempts, last_error) = match &delivery {
            Ok(r) if r.success => (EventWebhookStatus::Sent, r.attempts, None),
            Ok(r) => (EventWebhookStatus::Failed, r.attempts, r.error.clone()),
            Err(e) => (EventWebhookStatus::Failed, 0, Some(e.to_string())),
        };

        let mut event = Event::new(monitor.id.clone(), WebhookEvent::MonitorError.as_str(), serde_json::to_value(&payload).unwrap_or_default());
        event.webhook_status = status;
        event.webhook_attempts = attempts;
        event.webhook_last_error = last_error;
        if event.webhook_status == EventWebhookStatus::Sent {
            event.sent_at = Some(chrono::Utc::now());
        }
        if let Err(e) = self.repo.create_event(event).await {
            warn!(monitor_id = %monitor.id, error = %e, "failed to record monitor.error audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use stream_core::MonitorConfig;
    use stream_store::InMemoryRepository;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::error::PodManagerError;
    use crate::pod_manager::{PodPhase, WorkerPodInfo};

    #[derive(Default)]
    struct FakePodManager {
        pods: Mutex<Vec<WorkerPodInfo>>,
    }

    #[async_trait::async_trait]
    impl PodManager for FakePodManager {
        async fn create_worker(&self, spec: WorkerPodSpec) -> Result<WorkerPodInfo, PodManagerError> {
            let info = WorkerPodInfo {
                monitor_id: spec.monitor_id.clone(),
                pod_name: format!("stream-worker-{}", spec.monitor_id),
                phase: PodPhase::Running,
                node_name: None,
                resource_version: Some("1".to_string()),
            };
            self.pods.lock().unwrap().push(info.clone());
            Ok(info)
        }

        async fn delete_worker(&self, monitor_id: &str) -> Result<(), PodManagerError> {
            self.pods.lock().unwrap().retain(|p| p.monitor_id != monitor_id);
            Ok(())
        }

        async fn get_worker(&self, monitor_id: &str) -> Result<Option<WorkerPodInfo>, PodManagerError> {
            Ok(self.pods.lock().unwrap().iter().find(|p| p.monitor_id == monitor_id).cloned())
        }

        async fn list_workers(&self) -> Result<(Vec<WorkerPodInfo>, String), PodManagerError> {
            Ok((self.pods.lock().unwrap().clone(), "1".to_string()))
        }

        async fn resolve_owner(&self, pod_name: &str) -> Result<String, PodManagerError> {
            self.pods
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.pod_name == pod_name)
                .map(|p| p.monitor_id.clone())
                .ok_or_else(|| PodManagerError::NotFound(pod_name.to_string()))
        }
    }

    fn new_monitor(id: &str, status: MonitorStatus, callback_url: &str) -> Monitor {
        let now = Utc::now();
        Monitor {
            id: id.to_string(),
            stream_url: format!("https://example.com/{id}.m3u8"),
            callback_url: callback_url.to_string(),
            config: MonitorConfig::default(),
            metadata: serde_json::Value::Null,
            status,
            pod_name: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_dispatcher() -> Arc<WebhookDispatcher> {
        Arc::new(WebhookDispatcher::new(reqwest::Client::new(), true))
    }

    #[tokio::test]
    async fn sweep_flags_missing_monitor_as_error_and_emits_webhook() {
        let callback_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&callback_server)
            .await;
        let operator_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/operator"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&operator_server)
            .await;

        let repo = Arc::new(InMemoryRepository::new());
        let pods = Arc::new(FakePodManager::default());
        let monitor = repo
            .create(new_monitor("mon-1", MonitorStatus::Monitoring, &format!("{}/hook", callback_server.uri())))
            .await
            .unwrap();

        let reconciler = Reconciler::new(repo.clone(), pods.clone(), test_dispatcher())
            .with_operator_webhook_url(Some(format!("{}/operator", operator_server.uri())))
            .with_webhook_signing_key("signing-key");
        let report = reconciler.sweep().await;

        assert_eq!(report.missing_flagged, vec!["mon-1"]);
        assert!(report.errors.is_empty());
        assert!(pods.get_worker("mon-1").await.unwrap().is_none());
        assert_eq!(repo.get_by_id(&monitor.id).await.unwrap().status, MonitorStatus::Error);

        let events = repo.list_events(&monitor.id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "monitor.error");
        assert_eq!(events[0].webhook_status, EventWebhookStatus::Sent);
    }

    #[tokio::test]
    async fn sweep_deletes_zombie_pod_for_terminal_monitor() {
        let repo = Arc::new(InMemoryRepository::new());
        let pods = Arc::new(FakePodManager::default());
        let monitor = repo.create(new_monitor("mon-2", MonitorStatus::Monitoring, "https://example.com/hook")).await.unwrap();
        pods.create_worker(WorkerPodSpec {
            monitor_id: monitor.id.clone(),
            stream_url: monitor.stream_url.clone(),
            callback_url: monitor.callback_url.clone(),
            control_plane_url: "http://stream-api.internal".to_string(),
            extra_env: Vec::new(),
        })
        .await
        .unwrap();
        repo.update_status(&monitor.id, MonitorStatus::Completed).await.unwrap();

        let reconciler = Reconciler::new(repo, pods.clone(), test_dispatcher());
        let report = reconciler.sweep().await;

        assert_eq!(report.zombies_deleted, vec!["mon-2"]);
        assert!(pods.get_worker("mon-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_deletes_orphan_pod_with_unknown_monitor() {
        let repo = Arc::new(InMemoryRepository::new());
        let pods = Arc::new(FakePodManager::default());
        pods.create_worker(WorkerPodSpec {
            monitor_id: "mon-ghost".to_string(),
            stream_url: "https://example.com/ghost.m3u8".to_string(),
            callback_url: "https://example.com/hook".to_string(),
            control_plane_url: "http://stream-api.internal".to_string(),
            extra_env: Vec::new(),
        })
        .await
        .unwrap();

        let reconciler = Reconciler::new(repo, pods.clone(), test_dispatcher());
        let report = reconciler.sweep().await;

        assert_eq!(report.orphans_deleted, vec!["mon-ghost"]);
    }
}
