pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::resilience::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Stricter limiter for the metrics and admin routes.
    pub admin_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            admin_limiter: Arc::new(RateLimiter::new(config.rate_limits.admin.clone())),
            config: Arc::new(config),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let request_timeout = state.config.server.request_timeout();

    Router::new()
        .route("/v1/dispatch", post(handlers::dispatch_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health_handler))
        .route(
            "/admin/breakers/:id/reset",
            post(handlers::reset_breaker_handler),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ProviderClient, ProviderRequest, ProviderResponse, TokenUsage};
    use crate::config::models::tests::create_test_config;
    use crate::config::RateLimitConfig;
    use crate::dispatch::Provider;
    use crate::types::Result;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct EchoProvider;

    #[async_trait]
    impl ProviderClient for EchoProvider {
        async fn call(&self, request: &ProviderRequest, _timeout: Duration) -> Result<ProviderResponse> {
            Ok(ProviderResponse {
                text: format!("echo: {}", request.query),
                model: request.model.clone(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
                latency_ms: 50,
            })
        }
    }

    struct StalledProvider;

    #[async_trait]
    impl ProviderClient for StalledProvider {
        async fn call(&self, _request: &ProviderRequest, _timeout: Duration) -> Result<ProviderResponse> {
            std::future::pending().await
        }
    }

    fn app_with_limits(dispatch: usize, admin: usize) -> Router {
        let mut config = create_test_config();
        config.rate_limits.dispatch = RateLimitConfig {
            max_requests: dispatch,
            window_ms: 60_000,
            sweep_probability: 0.0,
        };
        config.rate_limits.admin = RateLimitConfig {
            max_requests: admin,
            window_ms: 60_000,
            sweep_probability: 0.0,
        };

        let dispatcher = Dispatcher::builder()
            .provider(Provider::new("primary", 0, Arc::new(EchoProvider)))
            .rate_limit(config.rate_limits.dispatch.clone())
            .build()
            .unwrap();
        create_router(AppState::new(config, dispatcher))
    }

    fn dispatch_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/dispatch")
            .header("content-type", "application/json")
            .header("x-api-key", "key-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_route() {
        let app = app_with_limits(5, 5);
        let response = app
            .oneshot(dispatch_request(json!({"sessionId": "s1", "query": "ping"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "4");

        let body = json_body(response).await;
        assert_eq!(body["text"], "echo: ping");
        assert_eq!(body["provider"], "primary");
        assert_eq!(body["success"], true);
        assert_eq!(body["offline"], false);
        assert_eq!(body["tier"], "high");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_providers_still_get_offline_reply() {
        let config = create_test_config();
        // Default retry policy: 3 attempts of 10s each, so both providers
        // together outlast the 60s request timeout
        let dispatcher = Dispatcher::builder()
            .provider(Provider::new("primary", 0, Arc::new(StalledProvider)))
            .provider(Provider::new("secondary", 1, Arc::new(StalledProvider)))
            .deadline(config.server.dispatch_deadline())
            .build()
            .unwrap();
        let app = create_router(AppState::new(config, dispatcher));

        let response = app
            .oneshot(dispatch_request(json!({"sessionId": "s1", "query": "anyone there?"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["offline"], true);
        assert_eq!(body["success"], false);
        assert_eq!(body["source"], "offline");
    }

    #[tokio::test]
    async fn test_dispatch_rate_limited() {
        let app = app_with_limits(1, 5);
        let first = app
            .clone()
            .oneshot(dispatch_request(json!({"sessionId": "s1", "query": "one"})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(dispatch_request(json!({"sessionId": "s1", "query": "two"})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().get("retry-after").is_some());
        assert_eq!(second.headers().get("x-ratelimit-remaining").unwrap(), "0");

        let body = json_body(second).await;
        assert_eq!(body["error"]["type"], "rate_limited");
    }

    #[tokio::test]
    async fn test_dispatch_rejects_empty_query() {
        let app = app_with_limits(5, 5);
        let response = app
            .oneshot(dispatch_request(json!({"sessionId": "s1", "query": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_uses_admin_limiter() {
        let app = app_with_limits(5, 1);
        let request = || {
            Request::builder()
                .uri("/metrics")
                .header("x-client-id", "ops")
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = json_body(first).await;
        assert_eq!(body["totalRequests"], 0);
        assert_eq!(body["breakerStates"]["primary"], "CLOSED");

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_health() {
        let app = app_with_limits(5, 5);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["providers"][0]["state"], "CLOSED");
    }

    #[tokio::test]
    async fn test_reset_unknown_breaker() {
        let app = app_with_limits(5, 5);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/breakers/nope/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_known_breaker() {
        let app = app_with_limits(5, 5);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/breakers/primary/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["provider"], "primary");
    }
}
