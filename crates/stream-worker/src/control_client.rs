//! Thin client for the worker's calls back to the Gateway's internal
//! surface: status heartbeat, self-terminate, and audit events.

use reqwest::Client;
use serde_json::Value;
use stream_core::{EventWebhookStatus, Health, StreamStatus, WorkerError};

pub struct ControlPlaneClient {
    client: Client,
    base_url: String,
    internal_api_key: String,
}

impl ControlPlaneClient {
    pub fn new(client: Client, base_url: impl Into<String>, internal_api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            internal_api_key: internal_api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// PUT /internal/v1/monitors/:id/status
    pub async fn heartbeat(
        &self,
        monitor_id: &str,
        status: &'static str,
        stream_status: Option<StreamStatus>,
        health: Option<(Health, Health)>,
        total_segments: Option<u64>,
    ) -> Result<(), WorkerError> {
        let mut body = serde_json::json!({ "status": status });
        if let Some(s) = stream_status {
            body["stream_status"] = serde_json::to_value(s).unwrap();
        }
        if let Some((video, audio)) = health {
            body["health"] = serde_json::json!({ "video": video, "audio": audio });
        }
        if let Some(segments) = total_segments {
            body["statistics"] = serde_json::json!({ "total_segments": segments });
        }

        let resp = self
            .client
            .put(self.url(&format!("/internal/v1/monitors/{monitor_id}/status")))
            .header("X-Internal-API-Key", &self.internal_api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkerError::ControlPlane(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(WorkerError::ControlPlane(format!("heartbeat rejected with {}", resp.status())));
        }
        Ok(())
    }

    /// POST /internal/v1/monitors/:id/terminate
    pub async fn terminate(&self, monitor_id: &str, reason: &str) -> Result<(), WorkerError> {
        let resp = self
            .client
            .post(self.url(&format!("/internal/v1/monitors/{monitor_id}/terminate")))
            .header("X-Internal-API-Key", &self.internal_api_key)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await
            .map_err(|e| WorkerError::ControlPlane(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(WorkerError::ControlPlane(format!("terminate rejected with {}", resp.status())));
        }
        Ok(())
    }

    /// POST /internal/v1/monitors/:id/events — audit row for a webhook
    /// attempt the worker already made itself.
    pub async fn record_event(
        &self,
        monitor_id: &str,
        event_type: &str,
        payload: Value,
        webhook_status: EventWebhookStatus,
    ) -> Result<(), WorkerError> {
        let resp = self
            .client
            .post(self.url(&format!("/internal/v1/monitors/{monitor_id}/events")))
            .header("X-Internal-API-Key", &self.internal_api_key)
            .json(&serde_json::json!({
                "event_type": event_type,
                "payload": payload,
                "webhook_status": webhook_status,
            }))
            .send()
            .await
            .map_err(|e| WorkerError::ControlPlane(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(WorkerError::ControlPlane(format!("event recording rejected with {}", resp.status())));
        }
        Ok(())
    }
}
