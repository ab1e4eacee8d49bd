//! The fallback chain.
//!
//! ```text
//! admit (rate limiter) --deny--> RateLimited
//!   |
//!   v
//! provider 1..n in priority order (breaker + retry each)
//!   | all exhausted or open
//!   v
//! exact cache -> similar cache -> offline reply
//! ```

pub mod dispatcher;
pub mod metrics;
pub mod provider;
pub mod session;

pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use metrics::{DispatchMetrics, MetricCounters, MetricsSnapshot};
pub use provider::Provider;
pub use session::SessionStore;

use serde::Serialize;
use serde_json::Value;

use crate::cost::ModelTier;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// Rate-limit identity: API key, client id or address.
    pub caller_key: String,
    pub session_id: String,
    pub query: String,
    pub payload: Option<Value>,
}

impl DispatchRequest {
    pub fn new(
        caller_key: impl Into<String>,
        session_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            caller_key: caller_key.into(),
            session_id: session_id.into(),
            query: query.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Provider,
    Cache,
    SimilarCache,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub request_id: String,
    pub text: String,
    pub source: ResponseSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// A provider produced this answer.
    pub success: bool,
    pub cached: bool,
    pub similar: bool,
    pub offline: bool,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub tier: ModelTier,
}
