use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::cost::ModelTier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default = "default_pricing")]
    pub pricing: HashMap<String, ModelPrice>,
    #[serde(default)]
    pub costs: CostsConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Budget for the provider stage of one dispatch. Kept below the request
    /// timeout so the cache or offline reply still reaches the caller.
    #[serde(default = "default_dispatch_deadline_ms")]
    pub dispatch_deadline_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            dispatch_deadline_ms: default_dispatch_deadline_ms(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_millis(self.dispatch_deadline_ms)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_dispatch_deadline_ms() -> u64 {
    50_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub include_query: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::Text,
            include_query: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default = "RateLimitConfig::general")]
    pub dispatch: RateLimitConfig,
    #[serde(default = "RateLimitConfig::strict")]
    pub admin: RateLimitConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            dispatch: RateLimitConfig::general(),
            admin: RateLimitConfig::strict(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,
}

impl RateLimitConfig {
    /// 20 admits per minute.
    pub fn general() -> Self {
        Self {
            max_requests: 20,
            window_ms: default_window_ms(),
            sweep_probability: default_sweep_probability(),
        }
    }

    /// 10 admits per minute, for expensive or administrative endpoints.
    pub fn strict() -> Self {
        Self {
            max_requests: 10,
            ..Self::general()
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::general()
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_sweep_probability() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub priority: u32,
    pub backend_type: BackendType,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default)]
    pub headers: HeaderConfig,
    /// Per-provider model names, overriding the governor's defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<TierModels>,
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

impl ProviderConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierModels {
    pub high: String,
    pub low: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    OpenAI,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            max_backoff_ms: 10000,
            jitter: true,
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderConfig {
    #[serde(default)]
    pub force: HashMap<String, String>,
    #[serde(default)]
    pub add: HashMap<String, String>,
    #[serde(default)]
    pub drop: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_ms: default_cache_ttl_ms(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl_ms() -> u64 {
    3_600_000
}

fn default_similarity_threshold() -> f64 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_model_high")]
    pub model_high: String,
    #[serde(default = "default_model_low")]
    pub model_low: String,
    #[serde(default = "default_lat_high_ms")]
    pub lat_high_ms: u64,
    #[serde(default = "default_tok_high")]
    pub tok_high: u64,
    #[serde(default = "default_lat_low_ms")]
    pub lat_low_ms: u64,
    #[serde(default = "default_tok_low")]
    pub tok_low: u64,
    #[serde(default = "default_stats_window")]
    pub window: usize,
    #[serde(default)]
    pub initial_tier: ModelTier,
    #[serde(default = "default_session_idle_ms")]
    pub session_idle_ms: u64,
}

impl GovernorConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::High => &self.model_high,
            ModelTier::Low => &self.model_low,
        }
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_millis(self.session_idle_ms)
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            model_high: default_model_high(),
            model_low: default_model_low(),
            lat_high_ms: default_lat_high_ms(),
            tok_high: default_tok_high(),
            lat_low_ms: default_lat_low_ms(),
            tok_low: default_tok_low(),
            window: default_stats_window(),
            initial_tier: ModelTier::High,
            session_idle_ms: default_session_idle_ms(),
        }
    }
}

fn default_model_high() -> String {
    "gpt-4o".to_string()
}

fn default_model_low() -> String {
    "gpt-4o-mini".to_string()
}

fn default_lat_high_ms() -> u64 {
    700
}

fn default_tok_high() -> u64 {
    600
}

fn default_lat_low_ms() -> u64 {
    400
}

fn default_tok_low() -> u64 {
    200
}

fn default_stats_window() -> usize {
    10
}

fn default_session_idle_ms() -> u64 {
    1_800_000
}

/// USD per 1K tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

pub fn default_pricing() -> HashMap<String, ModelPrice> {
    HashMap::from([
        (
            "gpt-4o".to_string(),
            ModelPrice {
                input_per_1k: 0.0025,
                output_per_1k: 0.01,
            },
        ),
        (
            "gpt-4o-mini".to_string(),
            ModelPrice {
                input_per_1k: 0.00015,
                output_per_1k: 0.0006,
            },
        ),
    ])
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostsConfig {
    /// Directory for `costs-YYYYMMDD.jsonl` files. Disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub budget: BudgetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_usd: Option<f64>,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    #[serde(default = "default_alert_ratio")]
    pub alert_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: None,
            monthly_usd: None,
            warning_ratio: default_warning_ratio(),
            alert_ratio: default_alert_ratio(),
        }
    }
}

fn default_warning_ratio() -> f64 {
    0.6
}

fn default_alert_ratio() -> f64 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    #[serde(default = "default_offline_replies")]
    pub replies: Vec<String>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            replies: default_offline_replies(),
        }
    }
}

pub fn default_offline_replies() -> Vec<String> {
    vec![
        "Sorry, I'm experiencing technical difficulties. Please try again in a few moments."
            .to_string(),
        "I can't reach the AI services right now. Could you rephrase your question?"
            .to_string(),
        "Apologies, there is a temporary problem with the services. Please try again shortly."
            .to_string(),
    ]
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.dispatch_deadline_ms == 0 {
            return Err("Server dispatch_deadline_ms must be > 0".to_string());
        }
        if self.server.dispatch_deadline() >= self.server.request_timeout() {
            return Err(format!(
                "Server dispatch_deadline_ms ({}) must be below request_timeout_secs ({}s)",
                self.server.dispatch_deadline_ms, self.server.request_timeout_secs
            ));
        }

        if self.providers.is_empty() {
            return Err("At least one provider must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.is_empty() {
                return Err("Provider id must not be empty".to_string());
            }

            if !seen.insert(provider.id.as_str()) {
                return Err(format!("Duplicate provider id '{}'", provider.id));
            }

            if provider.endpoint.is_empty() {
                return Err(format!("Provider '{}' has empty endpoint", provider.id));
            }

            if provider.timeout_ms == 0 {
                return Err(format!(
                    "Provider '{}' has invalid timeout (must be > 0)",
                    provider.id
                ));
            }

            if provider.retry.max_attempts == 0 {
                return Err(format!(
                    "Provider '{}' has invalid retry max_attempts (must be > 0)",
                    provider.id
                ));
            }

            if provider.circuit_breaker.failure_threshold == 0 {
                return Err(format!(
                    "Provider '{}' has invalid circuit_breaker failure_threshold (must be > 0)",
                    provider.id
                ));
            }
        }

        for (name, limit) in [
            ("dispatch", &self.rate_limits.dispatch),
            ("admin", &self.rate_limits.admin),
        ] {
            if limit.max_requests == 0 || limit.window_ms == 0 {
                return Err(format!(
                    "Rate limit '{}' must have max_requests > 0 and window_ms > 0",
                    name
                ));
            }
            if !(0.0..=1.0).contains(&limit.sweep_probability) {
                return Err(format!(
                    "Rate limit '{}' sweep_probability must be within [0, 1]",
                    name
                ));
            }
        }

        if self.cache.capacity == 0 {
            return Err("Cache capacity must be > 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err("Cache similarity_threshold must be within [0, 1]".to_string());
        }

        let governor = &self.governor;
        if governor.window == 0 {
            return Err("Governor window must be > 0".to_string());
        }
        if governor.lat_low_ms > governor.lat_high_ms {
            return Err("Governor lat_low_ms must not exceed lat_high_ms".to_string());
        }
        if governor.tok_low > governor.tok_high {
            return Err("Governor tok_low must not exceed tok_high".to_string());
        }

        let budget = &self.costs.budget;
        for (name, ratio) in [
            ("warning_ratio", budget.warning_ratio),
            ("alert_ratio", budget.alert_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(format!("Budget {} must be within (0, 1]", name));
            }
        }
        if budget.warning_ratio > budget.alert_ratio {
            return Err("Budget warning_ratio must not exceed alert_ratio".to_string());
        }

        if self.offline.replies.is_empty() {
            return Err("At least one offline reply must be configured".to_string());
        }

        Ok(())
    }
}
