use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::LoggingConfig;
use crate::dispatch::{DispatchRequest, DispatchResponse, ResponseSource};

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Serialize)]
pub struct DispatchRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub session_id: String,
    pub source: ResponseSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub success: bool,
    pub latency_ms: u64,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Emits one structured record per finished dispatch.
pub struct DispatchLogger {
    config: LoggingConfig,
}

impl DispatchLogger {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn record(&self, request: &DispatchRequest, response: &DispatchResponse) -> DispatchRecord {
        let (query, payload) = if self.config.include_query {
            (
                Some(request.query.clone()),
                request.payload.as_ref().map(redact),
            )
        } else {
            (None, None)
        };

        DispatchRecord {
            timestamp: Utc::now(),
            request_id: response.request_id.clone(),
            session_id: request.session_id.clone(),
            source: response.source,
            provider: response.provider.clone(),
            model: response.model.clone(),
            success: response.success,
            latency_ms: response.latency_ms,
            cost_usd: response.cost_usd,
            query,
            payload,
        }
    }

    pub fn log_dispatch(&self, request: &DispatchRequest, response: &DispatchResponse) {
        if !self.config.enabled {
            return;
        }

        let log = self.record(request, response);
        match log.source {
            ResponseSource::Offline => tracing::warn!(log = ?log, "Dispatch degraded to offline reply"),
            ResponseSource::Cache | ResponseSource::SimilarCache => {
                tracing::info!(log = ?log, "Dispatch answered from cache")
            }
            ResponseSource::Provider => tracing::info!(log = ?log, "Dispatch completed"),
        }
    }
}

/// Copy of `value` with secret-looking object fields blanked.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let inner = if is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(inner)
                    };
                    (key.clone(), inner)
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("authorization")
        || lower.contains("api-key")
        || lower.contains("api_key")
        || lower.contains("apikey")
        || lower.contains("token")
        || lower.contains("password")
        || lower.contains("secret")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::ModelTier;
    use serde_json::json;

    fn request() -> DispatchRequest {
        DispatchRequest::new("caller", "s1", "What is Rust?")
            .with_payload(json!({"temperature": 0.2, "api_key": "sk-123"}))
    }

    fn response() -> DispatchResponse {
        DispatchResponse {
            request_id: "req-1".to_string(),
            text: "A language.".to_string(),
            source: ResponseSource::Provider,
            provider: Some("primary".to_string()),
            model: Some("gpt-4o".to_string()),
            success: true,
            cached: false,
            similar: false,
            offline: false,
            cost_usd: 0.001,
            latency_ms: 120,
            tier: ModelTier::High,
        }
    }

    #[test]
    fn test_is_sensitive_key() {
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("x-api-key"));
        assert!(is_sensitive_key("refresh_token"));
        assert!(is_sensitive_key("client_secret"));
        assert!(is_sensitive_key("apiKey"));

        assert!(!is_sensitive_key("temperature"));
        assert!(!is_sensitive_key("model"));
    }

    #[test]
    fn test_redact_nested() {
        let value = json!({
            "model": "gpt-4o",
            "auth": {"password": "hunter2", "user": "ana"},
            "tools": [{"token": "abc"}]
        });
        let redacted = redact(&value);

        assert_eq!(redacted["model"], "gpt-4o");
        assert_eq!(redacted["auth"]["password"], REDACTED);
        assert_eq!(redacted["auth"]["user"], "ana");
        assert_eq!(redacted["tools"][0]["token"], REDACTED);
    }

    #[test]
    fn test_record_omits_query_by_default() {
        let logger = DispatchLogger::new(LoggingConfig::default());
        let record = logger.record(&request(), &response());

        assert!(record.query.is_none());
        assert!(record.payload.is_none());
        assert_eq!(record.provider.as_deref(), Some("primary"));
    }

    #[test]
    fn test_record_includes_redacted_payload() {
        let logger = DispatchLogger::new(LoggingConfig {
            include_query: true,
            ..LoggingConfig::default()
        });
        let record = logger.record(&request(), &response());

        assert_eq!(record.query.as_deref(), Some("What is Rust?"));
        let payload = record.payload.unwrap();
        assert_eq!(payload["api_key"], REDACTED);
        assert_eq!(payload["temperature"], 0.2);
    }

    #[test]
    fn test_disabled_logger_does_not_panic() {
        let logger = DispatchLogger::new(LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        });
        logger.log_dispatch(&request(), &response());
    }
}
