use std::sync::Arc;
use std::time::Duration;

use crate::backends::ProviderClient;
use crate::config::{CircuitBreakerConfig, GovernorConfig, ProviderConfig, RetryConfig, TierModels};
use crate::cost::ModelTier;
use crate::resilience::CircuitBreaker;

/// One entry of the fallback chain: a client plus the policy guarding it.
pub struct Provider {
    id: String,
    priority: u32,
    timeout: Duration,
    retry: RetryConfig,
    models: Option<TierModels>,
    breaker: CircuitBreaker,
    client: Arc<dyn ProviderClient>,
}

impl Provider {
    pub fn new(id: impl Into<String>, priority: u32, client: Arc<dyn ProviderClient>) -> Self {
        let id = id.into();
        Self {
            breaker: CircuitBreaker::new(id.clone(), CircuitBreakerConfig::default()),
            id,
            priority,
            timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            models: None,
            client,
        }
    }

    pub fn from_config(config: &ProviderConfig, client: Arc<dyn ProviderClient>) -> Self {
        Self::new(config.id.clone(), config.priority, client)
            .with_timeout(config.timeout_duration())
            .with_retry(config.retry.clone())
            .with_circuit_breaker(config.circuit_breaker.clone())
            .with_models(config.models.clone())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(self.id.clone(), config);
        self
    }

    pub fn with_models(mut self, models: Option<TierModels>) -> Self {
        self.models = models;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn client(&self) -> &Arc<dyn ProviderClient> {
        &self.client
    }

    /// Model name to request for `tier`, falling back to the governor's names.
    pub fn model_for<'a>(&'a self, tier: ModelTier, governor: &'a GovernorConfig) -> &'a str {
        match (&self.models, tier) {
            (Some(models), ModelTier::High) => &models.high,
            (Some(models), ModelTier::Low) => &models.low,
            (None, tier) => governor.model_for(tier),
        }
    }
}
