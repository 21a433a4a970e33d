use axum::routing::get;
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{rate_limit, require_internal_key, require_public_key};
use crate::routes;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    let public_api = routes::monitors::router()
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), require_public_key));

    let internal_api = routes::internal::router()
        .layer(middleware::from_fn_with_state(state.clone(), require_internal_key));

    Router::new()
        .nest("/api/v1", public_api)
        .nest("/internal/v1", internal_api)
        .route("/healthz", get(routes::health::healthz))
        .route("/readyz", get(routes::health::readyz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
