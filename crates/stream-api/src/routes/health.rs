use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::state::AppState;

/// GET /healthz — process is up; never depends on a downstream call.
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /readyz — the repository must answer a cheap query before this
/// instance is considered ready to receive traffic.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.repo.count_active_monitors().await {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}
