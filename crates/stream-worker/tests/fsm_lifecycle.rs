use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stream_core::manifest::ManifestSnapshot;
use stream_core::{ManifestSource, MonitorConfig, WebhookDispatcher, WorkerError};
use stream_worker::analyzer::{AnalysisResult, SegmentAnalyzer};
use stream_worker::prober::{LiveStatus, StreamProber};
use stream_worker::{ControlPlaneClient, Outcome, WorkerConfig, WorkerStateMachine};
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct LiveProber;

#[async_trait]
impl StreamProber for LiveProber {
    async fn is_live(&self, _stream_url: &str) -> Result<LiveStatus, WorkerError> {
        Ok(LiveStatus::Live { title: Some("test stream".to_string()) })
    }

    async fn get_manifest(&self, stream_url: &str) -> Result<String, WorkerError> {
        Ok(stream_url.to_string())
    }
}

struct EndlistManifest;

#[async_trait]
impl ManifestSource for EndlistManifest {
    async fn fetch(&self, _manifest_url: &str) -> Result<ManifestSnapshot, WorkerError> {
        Ok(ManifestSnapshot { latest_segment: None, end_of_stream: true })
    }
}

struct NeverCalledAnalyzer;

#[async_trait]
impl SegmentAnalyzer for NeverCalledAnalyzer {
    async fn analyze(&self, _segment_path: &Path) -> Result<AnalysisResult, WorkerError> {
        panic!("analyzer must not run when the manifest already reports end-of-stream");
    }
}

fn test_config(callback_url: String, control_plane_url: String) -> WorkerConfig {
    WorkerConfig {
        monitor_id: "mon-test".to_string(),
        stream_url: "https://example.com/watch?v=abc123".to_string(),
        callback_url,
        control_plane_url,
        internal_api_key: "internal-key".to_string(),
        webhook_signing_key: "signing-key".to_string(),
        waiting_initial_interval: Duration::from_millis(5),
        waiting_delayed_interval: Duration::from_millis(5),
        manifest_fetch_timeout: Duration::from_secs(5),
        manifest_refresh_interval: Duration::from_secs(300),
        segment_fetch_timeout: Duration::from_secs(5),
        segment_max_bytes: 10_000_000,
        check_interval: Duration::from_millis(5),
        tuning: MonitorConfig::default(),
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn completes_when_the_manifest_reports_end_of_stream_immediately() {
    let callback_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&callback_server)
        .await;

    let control_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/internal/v1/monitors/mon-test/status"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&control_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/internal/v1/monitors/mon-test/events"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&control_server)
        .await;

    let config = test_config(format!("{}/hook", callback_server.uri()), control_server.uri());

    let http = reqwest::Client::new();
    let control = Arc::new(ControlPlaneClient::new(
        http.clone(),
        config.control_plane_url.clone(),
        config.internal_api_key.clone(),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(http.clone(), true));

    let fsm = WorkerStateMachine::new(
        config,
        Arc::new(LiveProber),
        Arc::new(EndlistManifest),
        Arc::new(NeverCalledAnalyzer),
        dispatcher,
        control,
        http,
    );

    let (_tx, rx) = watch::channel(false);
    let outcome = tokio::time::timeout(Duration::from_secs(5), fsm.run(rx))
        .await
        .expect("worker did not finish within the test timeout");
    assert_eq!(outcome, Outcome::Completed);
}

#[tokio::test]
async fn stops_cleanly_when_cancelled_while_waiting_for_the_stream_to_go_live() {
    struct NeverLiveProber;

    #[async_trait]
    impl StreamProber for NeverLiveProber {
        async fn is_live(&self, _stream_url: &str) -> Result<LiveStatus, WorkerError> {
            Ok(LiveStatus::NotLive)
        }

        async fn get_manifest(&self, stream_url: &str) -> Result<String, WorkerError> {
            Ok(stream_url.to_string())
        }
    }

    let control_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/internal/v1/monitors/mon-test/status"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&control_server)
        .await;

    let config = test_config("http://127.0.0.1:1/unused".to_string(), control_server.uri());

    let http = reqwest::Client::new();
    let control = Arc::new(ControlPlaneClient::new(
        http.clone(),
        config.control_plane_url.clone(),
        config.internal_api_key.clone(),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(http.clone(), true));

    let fsm = WorkerStateMachine::new(
        config,
        Arc::new(NeverLiveProber),
        Arc::new(EndlistManifest),
        Arc::new(NeverCalledAnalyzer),
        dispatcher,
        control,
        http,
    );

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(fsm.run(rx));
    tokio::time::sleep(Duration::from_millis(20)).await;
    tx.send(true).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not finish within the test timeout")
        .expect("worker task panicked");
    assert_eq!(outcome, Outcome::Stopped);
}
