use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

use super::headers::apply_header_rules;
use super::traits::{ProviderClient, ProviderRequest, ProviderResponse, TokenUsage};
use crate::config::{BackendType, ProviderConfig};
use crate::types::{DispatchError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u64 = 1024;
const ERROR_BODY_LIMIT: usize = 512;

/// Provider reached over HTTP with an OpenAI, Anthropic or Ollama wire format.
pub struct HttpProvider {
    id: String,
    backend_type: BackendType,
    endpoint: String,
    client: Client,
    headers: HeaderMap,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let mut builder = ClientBuilder::new()
            .timeout(config.timeout_duration())
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if !config.ssl_verify {
            tracing::warn!(
                provider = %config.id,
                endpoint = %config.endpoint,
                "SSL verification is disabled for this provider"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| DispatchError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let headers = apply_header_rules(base_headers(config)?, &config.headers)?;

        Ok(Self {
            id: config.id.clone(),
            backend_type: config.backend_type,
            endpoint: config.endpoint.clone(),
            client,
            headers,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let mut body = match self.backend_type {
            BackendType::OpenAI => json!({
                "messages": [{"role": "user", "content": request.query}],
            }),
            BackendType::Anthropic => json!({
                "max_tokens": ANTHROPIC_MAX_TOKENS,
                "messages": [{"role": "user", "content": request.query}],
            }),
            BackendType::Ollama => json!({
                "messages": [{"role": "user", "content": request.query}],
                "stream": false,
            }),
        };

        if let (Some(Value::Object(extra)), Value::Object(target)) = (&request.payload, &mut body) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        if let Value::Object(target) = &mut body {
            target.insert("model".to_string(), Value::String(request.model.clone()));
        }

        body
    }

    fn parse_body(&self, body: &Value) -> Result<(String, Option<TokenUsage>)> {
        let (text, usage) = match self.backend_type {
            BackendType::OpenAI => (
                body.pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage_from(body, "/usage/prompt_tokens", "/usage/completion_tokens"),
            ),
            BackendType::Anthropic => (
                anthropic_text(body),
                usage_from(body, "/usage/input_tokens", "/usage/output_tokens"),
            ),
            BackendType::Ollama => (
                body.pointer("/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage_from(body, "/prompt_eval_count", "/eval_count"),
            ),
        };

        let text = text.ok_or_else(|| DispatchError::Provider {
            provider: self.id.clone(),
            message: "Response carried no completion text".to_string(),
        })?;
        Ok((text, usage))
    }

    fn map_send_error(&self, error: reqwest::Error, timeout: Duration) -> DispatchError {
        if error.is_timeout() {
            DispatchError::ProviderTimeout {
                provider: self.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            DispatchError::Http(error)
        }
    }
}

fn base_headers(config: &ProviderConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let Some(api_key) = config.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(headers);
    };

    let invalid_key = |e: InvalidHeaderValue| {
        DispatchError::Config(format!("Invalid API key for '{}': {}", config.id, e))
    };
    match config.backend_type {
        BackendType::Anthropic => {
            headers.insert("x-api-key", HeaderValue::from_str(api_key).map_err(invalid_key)?);
            headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        }
        BackendType::OpenAI | BackendType::Ollama => {
            let value = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(invalid_key)?;
            headers.insert(AUTHORIZATION, value);
        }
    }
    Ok(headers)
}

fn usage_from(body: &Value, input: &str, output: &str) -> Option<TokenUsage> {
    let input_tokens = body.pointer(input).and_then(Value::as_u64);
    let output_tokens = body.pointer(output).and_then(Value::as_u64);
    if input_tokens.is_none() && output_tokens.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input_tokens.unwrap_or(0),
        output_tokens: output_tokens.unwrap_or(0),
    })
}

fn anthropic_text(body: &Value) -> Option<String> {
    let blocks = body.get("content")?.as_array()?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text.join(""))
    }
}

fn truncate(mut message: String) -> String {
    if message.len() > ERROR_BODY_LIMIT {
        let mut end = ERROR_BODY_LIMIT;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn call(&self, request: &ProviderRequest, timeout: Duration) -> Result<ProviderResponse> {
        let started = Instant::now();
        let body = self.build_body(request);

        tracing::debug!(
            provider = %self.id,
            model = %request.model,
            endpoint = %self.endpoint,
            "Sending provider request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;

        if !status.is_success() {
            return Err(DispatchError::Upstream {
                status: status.as_u16(),
                message: truncate(text),
            });
        }

        let parsed: Value = serde_json::from_str(&text)?;
        let (completion, usage) = self.parse_body(&parsed)?;
        let usage = usage.unwrap_or_else(|| TokenUsage::estimate(&request.query, &completion));
        let model = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();

        Ok(ProviderResponse {
            text: completion,
            model,
            usage,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
