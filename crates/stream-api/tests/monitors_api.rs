//! End-to-end exercise of the HTTP surface with an in-memory repository
//! and a fake pod manager — no live cluster, no live Postgres, mirrors
//! how the teacher drives `hls-api` in its own integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use stream_api::{build_app, ApiConfig, AppState};
use stream_core::WebhookDispatcher;
use stream_orchestrator::{PodManager, PodManagerError, Reconciler, WorkerPodInfo, WorkerPodSpec};
use stream_store::{InMemoryRepository, Repository};

const PUBLIC_KEY: &str = "test-public-key";
const INTERNAL_KEY: &str = "test-internal-key";

/// In-process stand-in for the Kubernetes pod manager; optionally made
/// to fail so `create_monitor`'s error path can be exercised.
#[derive(Default)]
struct FakePodManager {
    fail: bool,
    pods: Mutex<HashMap<String, WorkerPodInfo>>,
}

#[async_trait]
impl PodManager for FakePodManager {
    async fn create_worker(&self, spec: WorkerPodSpec) -> Result<WorkerPodInfo, PodManagerError> {
        if self.fail {
            return Err(PodManagerError::UnresolvedOwner(spec.monitor_id));
        }
        let info = WorkerPodInfo {
            monitor_id: spec.monitor_id.clone(),
            pod_name: format!("stream-worker-{}", spec.monitor_id),
            phase: stream_orchestrator::PodPhase::Pending,
            node_name: None,
            resource_version: Some("1".into()),
        };
        self.pods.lock().unwrap().insert(spec.monitor_id, info.clone());
        Ok(info)
    }

    async fn delete_worker(&self, monitor_id: &str) -> Result<(), PodManagerError> {
        self.pods.lock().unwrap().remove(monitor_id);
        Ok(())
    }

    async fn get_worker(&self, monitor_id: &str) -> Result<Option<WorkerPodInfo>, PodManagerError> {
        Ok(self.pods.lock().unwrap().get(monitor_id).cloned())
    }

    async fn list_workers(&self) -> Result<(Vec<WorkerPodInfo>, String), PodManagerError> {
        Ok((self.pods.lock().unwrap().values().cloned().collect(), "1".into()))
    }

    async fn resolve_owner(&self, pod_name: &str) -> Result<String, PodManagerError> {
        self.pods
            .lock()
            .unwrap()
            .values()
            .find(|p| p.pod_name == pod_name)
            .map(|p| p.monitor_id.clone())
            .ok_or_else(|| PodManagerError::NotFound(pod_name.to_string()))
    }
}

fn test_config() -> ApiConfig {
    ApiConfig {
        public_api_key: PUBLIC_KEY.to_string(),
        internal_api_key: INTERNAL_KEY.to_string(),
        webhook_signing_key: "signing-key".to_string(),
        max_monitors: 2,
        internal_base_url: "http://stream-api.internal".to_string(),
        operator_webhook_url: None,
        allow_private_callbacks: true,
        rate_limit_max_requests: 1_000,
        rate_limit_window: Duration::from_secs(60),
    }
}

fn build_test_app(pods_fail: bool) -> axum::Router {
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let pods: Arc<dyn PodManager> = Arc::new(FakePodManager { fail: pods_fail, ..Default::default() });
    let dispatcher = Arc::new(WebhookDispatcher::new(reqwest::Client::new(), true));
    let reconciler = Arc::new(
        Reconciler::new(repo.clone(), pods, dispatcher.clone()).with_internal_base_url("http://stream-api.internal"),
    );
    let state = AppState::new(repo, reconciler, dispatcher, test_config());
    build_app(state)
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/monitors")
        .header("content-type", "application/json")
        .header("X-API-Key", PUBLIC_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn rejects_requests_without_an_api_key() {
    let app = build_test_app(false);
    let resp = app
        .oneshot(Request::builder().uri("/api/v1/monitors").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn creates_a_monitor_and_then_fetches_it() {
    let app = build_test_app(false);

    let body = json!({
        "stream_url": "https://www.youtube.com/watch?v=abc123",
        "callback_url": "https://operator.example.com/webhooks/stream"
    });
    let resp = app.clone().oneshot(create_request(body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = body_json(resp).await;
    let id = created["monitor_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "initializing");

    let get_resp = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/monitors/{id}"))
                .header("X-API-Key", PUBLIC_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_resp.status(), StatusCode::OK);
    let detail = body_json(get_resp).await;
    assert_eq!(detail["monitor_id"], id);
    assert_eq!(detail["stream_url"], "https://www.youtube.com/watch?v=abc123");
}

#[tokio::test]
async fn rejects_a_non_youtube_watch_url() {
    let app = build_test_app(false);
    let body = json!({
        "stream_url": "https://youtu.be/abc123",
        "callback_url": "https://operator.example.com/webhooks/stream"
    });
    let resp = app.oneshot(create_request(body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err = body_json(resp).await;
    assert_eq!(err["error"]["code"], "INVALID_URL");
}

#[tokio::test]
async fn rejects_a_duplicate_active_stream_url() {
    let app = build_test_app(false);
    let body = json!({
        "stream_url": "https://www.youtube.com/watch?v=dup001",
        "callback_url": "https://operator.example.com/webhooks/stream"
    });

    let first = app.clone().oneshot(create_request(body.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = app.oneshot(create_request(body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let err = body_json(second).await;
    assert_eq!(err["error"]["code"], "DUPLICATE_MONITOR");
}

#[tokio::test]
async fn enforces_the_max_monitors_admission_limit() {
    let app = build_test_app(false);
    for i in 0..2 {
        let body = json!({
            "stream_url": format!("https://www.youtube.com/watch?v=limit{i}"),
            "callback_url": "https://operator.example.com/webhooks/stream"
        });
        let resp = app.clone().oneshot(create_request(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    let body = json!({
        "stream_url": "https://www.youtube.com/watch?v=limitover",
        "callback_url": "https://operator.example.com/webhooks/stream"
    });
    let resp = app.oneshot(create_request(body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let err = body_json(resp).await;
    assert_eq!(err["error"]["code"], "MAX_MONITORS_EXCEEDED");
}

#[tokio::test]
async fn flips_a_monitor_to_error_when_worker_creation_fails() {
    let app = build_test_app(true);
    let body = json!({
        "stream_url": "https://www.youtube.com/watch?v=failcreate",
        "callback_url": "https://operator.example.com/webhooks/stream"
    });
    let resp = app.oneshot(create_request(body)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let err = body_json(resp).await;
    assert_eq!(err["error"]["code"], "KUBERNETES_ERROR");
}

#[tokio::test]
async fn internal_terminate_is_idempotent_for_an_unknown_monitor() {
    let app = build_test_app(false);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/internal/v1/monitors/does-not-exist/terminate")
                .header("content-type", "application/json")
                .header("X-Internal-API-Key", INTERNAL_KEY)
                .body(Body::from(json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["deleted"], false);
}

#[tokio::test]
async fn internal_terminate_deletes_the_monitor_row() {
    let app = build_test_app(false);
    let body = json!({
        "stream_url": "https://www.youtube.com/watch?v=terminateme",
        "callback_url": "https://operator.example.com/webhooks/stream"
    });
    let created = body_json(app.clone().oneshot(create_request(body)).await.unwrap()).await;
    let id = created["monitor_id"].as_str().unwrap().to_string();

    let terminate_request = || {
        Request::builder()
            .method("POST")
            .uri(format!("/internal/v1/monitors/{id}/terminate"))
            .header("content-type", "application/json")
            .header("X-Internal-API-Key", INTERNAL_KEY)
            .body(Body::from(json!({ "reason": "webhook_delivery_failed" }).to_string()))
            .unwrap()
    };

    let first = app.clone().oneshot(terminate_request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_json(first).await["deleted"], true);

    let get_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/monitors/{id}"))
                .header("X-API-Key", PUBLIC_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get_resp.status(), StatusCode::NOT_FOUND);

    let second = app.oneshot(terminate_request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await["deleted"], false);
}

#[tokio::test]
async fn internal_surface_rejects_the_public_key() {
    let app = build_test_app(false);
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/internal/v1/monitors/some-id/terminate")
                .header("content-type", "application/json")
                .header("X-Internal-API-Key", PUBLIC_KEY)
                .body(Body::from(json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn healthz_and_readyz_require_no_api_key() {
    let app = build_test_app(false);
    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
