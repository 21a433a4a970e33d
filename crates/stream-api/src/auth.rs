//! Constant-time API-key checks, applied as `from_fn_with_state` layers
//! ahead of the public and internal route groups respectively.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

fn extract_key(req: &Request, header_name: &str) -> Option<String> {
    if let Some(v) = req.headers().get(header_name).and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub async fn require_public_key(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    match extract_key(&req, "X-API-Key") {
        Some(key) if constant_time_eq(&key, &state.config.public_api_key) => Ok(next.run(req).await),
        _ => Err(ApiError::Unauthorized),
    }
}

pub async fn require_internal_key(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    match extract_key(&req, "X-Internal-API-Key") {
        Some(key) if constant_time_eq(&key, &state.config.internal_api_key) => Ok(next.run(req).await),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Identifies the caller for the rate limiter: the API key itself when
/// present (it already authenticated), else the client's socket address.
pub fn rate_limit_key(req: &Request) -> String {
    if let Some(key) = req.headers().get("X-API-Key").and_then(|v| v.to_str().ok()) {
        return format!("key:{key}");
    }
    if let Some(addr) = req.extensions().get::<axum::extract::ConnectInfo<std::net::SocketAddr>>() {
        return format!("ip:{}", addr.0.ip());
    }
    "unknown".to_string()
}

pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    let key = rate_limit_key(&req);
    if !state.rate_limiter.check(&key) {
        return Err(ApiError::RateLimitExceeded);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths_and_bytes() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "diff"));
        assert!(!constant_time_eq("short", "longer-key"));
    }
}
