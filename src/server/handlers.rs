use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::dispatch::DispatchRequest;
use crate::resilience::RateLimitDecision;
use crate::types::{DispatchError, Result};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchBody {
    pub session_id: String,
    pub query: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Rate-limit identity: `x-api-key`, then `x-client-id`, then the peer address.
pub fn caller_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    for name in ["x-api-key", "x-client-id"] {
        if let Some(value) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
        {
            return value.trim().to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

fn rate_limit_headers(decision: &RateLimitDecision) -> [(HeaderName, HeaderValue); 3] {
    [
        (X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit as u64)),
        (X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining as u64)),
        (X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at.timestamp().max(0) as u64)),
    ]
}

fn rejected(decision: &RateLimitDecision) -> Response {
    let error = DispatchError::RateLimited {
        retry_after_ms: decision.retry_after_ms,
    };
    (rate_limit_headers(decision), error).into_response()
}

fn admin_admit(state: &AppState, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<Response> {
    let decision = state.admin_limiter.admit(&caller_key(headers, peer));
    if decision.allowed {
        None
    } else {
        Some(rejected(&decision))
    }
}

pub async fn dispatch_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<DispatchBody>,
) -> Result<Response> {
    if body.session_id.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("sessionId must not be empty".to_string()));
    }
    if body.query.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("query must not be empty".to_string()));
    }

    let key = caller_key(&headers, peer.map(|ConnectInfo(addr)| addr));
    let decision = state.dispatcher.admit(&key);
    if !decision.allowed {
        return Ok(rejected(&decision));
    }

    let mut request = DispatchRequest::new(key, body.session_id, body.query);
    request.payload = body.payload;

    // Dropping this future on client disconnect releases any held probe slot
    let response = state
        .dispatcher
        .dispatch_admitted(request, CancellationToken::new())
        .await?;

    Ok((rate_limit_headers(&decision), Json(response)).into_response())
}

pub async fn metrics_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    if let Some(rejection) = admin_admit(&state, &headers, peer.map(|ConnectInfo(addr)| addr)) {
        return rejection;
    }
    Json(state.dispatcher.get_metrics()).into_response()
}

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = state
        .dispatcher
        .providers()
        .iter()
        .map(|p| {
            let snapshot = p.breaker().snapshot();
            json!({
                "id": snapshot.provider_id,
                "state": snapshot.state,
                "health": snapshot.health,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "providers": providers,
    }))
}

pub async fn reset_breaker_handler(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response> {
    if let Some(rejection) = admin_admit(&state, &headers, peer.map(|ConnectInfo(addr)| addr)) {
        return Ok(rejection);
    }

    state.dispatcher.reset_breaker(&provider_id)?;
    tracing::info!(provider = %provider_id, "Breaker reset via admin endpoint");

    Ok(Json(json!({
        "provider": provider_id,
        "state": "CLOSED",
    }))
    .into_response())
}
