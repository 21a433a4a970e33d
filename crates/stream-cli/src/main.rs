#![forbid(unsafe_code)]

mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use stream_api::{build_app, ApiConfig, AppState};
use stream_core::{
    DashManifestSource, HlsManifestSource, ManifestSource, WebhookDispatcher,
};
use stream_orchestrator::{KubePodManager, PodFailureWatcher, PodManager, Reconciler};
use stream_store::{run_migrations, PostgresRepository, Repository};
use stream_worker::{ControlPlaneClient, HttpStreamProber, Outcome, WorkerStateMachine};

use config::GatewayConfig;

fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Control-plane gateway and per-monitor worker for the stream monitoring system.
#[derive(Parser)]
#[command(name = "stream-monitor", version = version_string(), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane HTTP API, reconciler, and pod watcher.
    Gateway,
    /// Run a single monitor's worker process to completion.
    Worker,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway => run_gateway().await,
        Commands::Worker => run_worker().await,
    }
}

fn init_tracing(environment: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match environment {
        "production" | "prod" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }
}

async fn run_gateway() {
    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            init_tracing("development");
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.environment);

    let pool = match PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.db_dsn)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_migrations(&pool).await {
        tracing::error!(error = %e, "Failed to run migrations");
        std::process::exit(1);
    }

    let repo_concrete = Arc::new(PostgresRepository::new(pool));
    let repo: Arc<dyn Repository> = repo_concrete.clone();

    let kube_client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build Kubernetes client");
            std::process::exit(1);
        }
    };

    tracing::info!(in_cluster = config.in_cluster, namespace = %config.namespace, "Kubernetes client ready");

    let pods: Arc<dyn PodManager> = Arc::new(KubePodManager::new(
        kube_client.clone(),
        config.namespace.clone(),
        config.worker_image_ref(),
    ));

    let internal_base_url = reconciler_internal_base_url(&config);

    let http = reqwest::Client::new();
    let dispatcher = Arc::new(WebhookDispatcher::new(http, false));

    let reconciler = Arc::new(
        Reconciler::new(repo.clone(), pods.clone(), dispatcher.clone())
            .with_sweep_timeout(config.reconcile_timeout)
            .with_internal_base_url(internal_base_url.clone())
            .with_operator_webhook_url(config.reconciliation_webhook_url.clone())
            .with_webhook_signing_key(config.webhook_signing_key.clone()),
    );

    let api_config = ApiConfig {
        public_api_key: config.api_key.clone(),
        internal_api_key: config.internal_api_key.clone(),
        webhook_signing_key: config.webhook_signing_key.clone(),
        max_monitors: config.max_monitors,
        internal_base_url,
        operator_webhook_url: config.reconciliation_webhook_url.clone(),
        allow_private_callbacks: config.environment != "production",
        rate_limit_max_requests: 100,
        rate_limit_window: Duration::from_secs(60),
    };

    let state = AppState::new(repo.clone(), reconciler.clone(), dispatcher.clone(), api_config);
    let app = build_app(state);

    if config.reconcile_on_boot {
        let report = reconciler.sweep().await;
        tracing::info!(?report, "Initial reconciliation swept on boot");
    }

    let reconcile_handle = {
        let reconciler = reconciler.clone();
        let interval = config.reconcile_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = reconciler.sweep().await;
                tracing::debug!(?report, "Periodic reconciliation swept");
            }
        })
    };

    let watcher_handle = if config.in_cluster {
        let watcher = Arc::new(
            PodFailureWatcher::new(kube_client, config.namespace.clone(), repo_concrete.clone(), pods.clone(), dispatcher.clone())
                .with_operator_webhook_url(config.reconciliation_webhook_url.clone())
                .with_webhook_signing_key(config.webhook_signing_key.clone()),
        );
        Some(tokio::spawn(async move { watcher.run().await }))
    } else {
        tracing::warn!("IN_CLUSTER is false: skipping pod failure watcher");
        None
    };

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = config.port, "Failed to bind listen address");
            std::process::exit(1);
        }
    };

    tracing::info!(port = config.port, "Starting stream-monitor gateway");
    let mut server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping background tasks...");
    reconcile_handle.abort();
    if let Some(handle) = watcher_handle {
        handle.abort();
    }

    tokio::select! {
        res = &mut server_handle => {
            match res {
                Ok(Ok(())) => tracing::info!("Shutdown complete"),
                Ok(Err(e)) => tracing::error!(error = %e, "Server exited with an error"),
                Err(e) => tracing::error!(error = %e, "Server task panicked"),
            }
        }
        _ = tokio::time::sleep(config.shutdown_timeout) => {
            tracing::warn!("Shutdown timed out, aborting server task");
            server_handle.abort();
        }
    }
}

fn reconciler_internal_base_url(config: &GatewayConfig) -> String {
    format!("http://stream-gateway.{}.svc.cluster.local:{}", config.namespace, config.port)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_worker() {
    let config = match config::worker_config_from_env() {
        Ok(c) => c,
        Err(e) => {
            init_tracing("development");
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    init_tracing(&environment);

    tracing::info!(monitor_id = %config.monitor_id, stream_url = %config.stream_url, "Starting worker");

    let http = reqwest::Client::builder()
        .timeout(config.segment_fetch_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    let prober = Arc::new(HttpStreamProber::new(http.clone()));
    let manifest: Arc<dyn ManifestSource> = if config.stream_url.to_ascii_lowercase().ends_with(".mpd") {
        Arc::new(DashManifestSource::new(http.clone()))
    } else {
        Arc::new(HlsManifestSource::new(http.clone()))
    };
    let analyzer = Arc::new(stream_worker::SubprocessAnalyzer::new(
        std::env::var("ANALYZER_BINARY").unwrap_or_else(|_| "stream-segment-analyzer".to_string()),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(http.clone(), environment != "production"));
    let control = Arc::new(ControlPlaneClient::new(
        http.clone(),
        config.control_plane_url.clone(),
        config.internal_api_key.clone(),
    ));

    let fsm = WorkerStateMachine::new(config, prober, manifest, analyzer, dispatcher, control, http);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });

    let outcome = fsm.run(rx).await;
    tracing::info!(?outcome, "Worker finished");

    match outcome {
        Outcome::Completed | Outcome::Stopped => std::process::exit(0),
        Outcome::Error => std::process::exit(1),
    }
}
