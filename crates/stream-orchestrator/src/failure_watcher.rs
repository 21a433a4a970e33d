//! Lists failed worker pods once on startup, then keeps a long-lived
//! watch open for new failures. Flips the owning monitor to `Error`
//! via a conditional update so a reconciler sweep racing the same pod
//! can never double-apply the transition, then emits a `monitor.error`
//! webhook and removes the dead pod.

use std::sync::Arc;
use std::time::Duration;

use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, error, info, warn};

use stream_core::{Event, EventWebhookStatus, MonitorStatus, WebhookDispatcher, WebhookEvent, WebhookPayload};
use stream_store::Repository;

use crate::pod_manager::{PodManager, MONITOR_LABEL};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const WATCH_TIMEOUT_SECS: u32 = 280;

struct PodFailure {
    message: String,
    exit_code: Option<i32>,
    termination_reason: Option<String>,
}

fn failure_info(pod: &Pod) -> PodFailure {
    let Some(status) = &pod.status else {
        return PodFailure {
            message: "unknown".to_string(),
            exit_code: None,
            termination_reason: None,
        };
    };
    let containers = status.container_statuses.iter().flatten();
    let init_containers = status.init_container_statuses.iter().flatten();

    for cs in containers.chain(init_containers) {
        if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            if terminated.exit_code != 0 {
                let reason = terminated.reason.clone().unwrap_or_else(|| "Error".to_string());
                return PodFailure {
                    message: format!("{} (container {}, exit code {})", reason, cs.name, terminated.exit_code),
                    exit_code: Some(terminated.exit_code),
                    termination_reason: Some(reason),
                };
            }
        }
    }

    PodFailure {
        message: status.reason.clone().unwrap_or_else(|| "pod entered Failed phase".to_string()),
        exit_code: None,
        termination_reason: status.reason.clone(),
    }
}

pub struct PodFailureWatcher<R> {
    client: Client,
    namespace: String,
    repo: Arc<R>,
    pods: Arc<dyn PodManager>,
    dispatcher: Arc<WebhookDispatcher>,
    operator_webhook_url: Option<String>,
    webhook_signing_key: String,
}

impl<R: Repository + 'static> PodFailureWatcher<R> {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        repo: Arc<R>,
        pods: Arc<dyn PodManager>,
        dispatcher: Arc<WebhookDispatcher>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            repo,
            pods,
            dispatcher,
            operator_webhook_url: None,
            webhook_signing_key: String::new(),
        }
    }

    pub fn with_operator_webhook_url(mut self, url: Option<String>) -> Self {
        self.operator_webhook_url = url;
        self
    }

    pub fn with_webhook_signing_key(mut self, key: impl Into<String>) -> Self {
        self.webhook_signing_key = key.into();
        self
    }

    fn api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Runs until cancelled. Reconnects with exponential backoff on any
    /// stream error; never returns `Err`, since a transient apiserver
    /// blip should not take down the whole gateway process.
    pub async fn run(&self) {
        self.handle_existing_failures().await;

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.watch_once().await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "pod failure watch stream ended, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn handle_existing_failures(&self) {
        let lp = ListParams::default()
            .labels(crate::pod_manager::APP_LABEL_SELECTOR)
            .fields("status.phase=Failed");
        match self.api().list(&lp).await {
            Ok(list) => {
                for pod in &list.items {
                    self.handle_failed_pod(pod).await;
                }
            }
            Err(e) => error!(error = %e, "initial failed-pod list failed"),
        }
    }

    async fn watch_once(&self) -> Result<(), kube::Error> {
        let wp = WatchParams::default()
            .labels(crate::pod_manager::APP_LABEL_SELECTOR)
            .timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api().watch(&wp, "0").await?;
        pin_mut!(stream);

        while let Some(event) = stream.try_next().await? {
            match event {
                WatchEvent::Modified(pod) | WatchEvent::Added(pod) => {
                    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed") {
                        self.handle_failed_pod(&pod).await;
                    }
                }
                WatchEvent::Error(e) => {
                    debug!(error = %e, "watch stream reported an error event");
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_failed_pod(&self, pod: &Pod) {
        let Some(monitor_id) = pod.metadata.labels.as_ref().and_then(|l| l.get(MONITOR_LABEL)).cloned() else {
            return;
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let failure = failure_info(pod);

        for candidate in [MonitorStatus::Monitoring, MonitorStatus::Waiting, MonitorStatus::Initializing] {
            match self
                .repo
                .update_status_with_condition(&monitor_id, candidate, MonitorStatus::Error)
                .await
            {
                Ok(true) => {
                    info!(monitor_id, message = %failure.message, "flipped monitor to error after pod failure");
                    self.emit_pod_failure(&monitor_id, &pod_name, &failure).await;
                    if let Err(e) = self.pods.delete_worker(&monitor_id).await {
                        warn!(monitor_id, error = %e, "failed to delete pod after flipping monitor to error");
                    }
                    return;
                }
                Ok(false) => continue,
                Err(e) => {
                    error!(monitor_id, error = %e, "failed to apply conditional status update after pod failure");
                    return;
                }
            }
        }
    }

    /// Emits a `monitor.error` webhook to the operator sink (if
    /// configured) and the monitor's own `callback_url`, recording the
    /// latter attempt as an audit event.
    async fn emit_pod_failure(&self, monitor_id: &str, pod_name: &str, failure: &PodFailure) {
        let monitor = match self.repo.get_by_id(monitor_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(monitor_id, error = %e, "could not load monitor to emit pod_failure webhook");
                return;
            }
        };

        let mut data = json!({
            "reason": "pod_failure",
            "exit_code": failure.exit_code,
            "message": failure.message,
            "pod_name": pod_name,
        });
        if let Some(termination_reason) = &failure.termination_reason {
            data["termination_reason"] = json!(termination_reason);
        }

        let metadata = if monitor.metadata.is_null() { None } else { Some(monitor.metadata.clone()) };
        let payload = WebhookPayload::new(WebhookEvent::MonitorError, monitor.id.clone(), monitor.stream_url.clone(), data, metadata);

        if let Some(operator_url) = &self.operator_webhook_url {
            match self.dispatcher.deliver(operator_url, &self.webhook_signing_key, &payload).await {
                Ok(result) if !result.success => {
                    warn!(monitor_id, error = ?result.error, "operator webhook delivery failed for monitor.error");
                }
                Err(e) => warn!(monitor_id, error = %e, "operator webhook dispatch error"),
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
            warn!(monitor_id, error = %e, "failed to record monitor.error audit event");
        }
    }
}
