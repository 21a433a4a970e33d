use std::sync::Arc;
use std::time::Duration;

use stream_core::WebhookDispatcher;
use stream_orchestrator::{PodManager, Reconciler};
use stream_store::Repository;

use crate::ratelimit::RateLimiter;

/// Static config for the running gateway process — everything read once
/// from the environment at startup and never mutated afterwards.
#[derive(Clone)]
pub struct ApiConfig {
    pub public_api_key: String,
    pub internal_api_key: String,
    pub webhook_signing_key: String,
    pub max_monitors: u64,
    pub internal_base_url: String,
    pub operator_webhook_url: Option<String>,
    pub allow_private_callbacks: bool,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub reconciler: Arc<Reconciler<dyn Repository, dyn PodManager>>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub config: Arc<ApiConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn Repository>,
        reconciler: Arc<Reconciler<dyn Repository, dyn PodManager>>,
        dispatcher: Arc<WebhookDispatcher>,
        config: ApiConfig,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_max_requests, config.rate_limit_window));
        Self {
            repo,
            reconciler,
            dispatcher,
            config: Arc::new(config),
            rate_limiter,
        }
    }
}
