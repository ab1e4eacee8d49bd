use futures::FutureExt;
use rand::seq::SliceRandom;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::metrics::{DispatchMetrics, MetricsSnapshot};
use super::provider::Provider;
use super::session::SessionStore;
use super::{DispatchRequest, DispatchResponse, ResponseSource};
use crate::backends::{build_provider, ProviderClient, ProviderRequest, ProviderResponse};
use crate::cache::ResponseCache;
use crate::config::{
    default_offline_replies, default_pricing, CacheConfig, Config, CostsConfig, GovernorConfig,
    LoggingConfig, ModelPrice, RateLimitConfig,
};
use crate::cost::{
    AlertCallback, BudgetMonitor, CostEvent, CostGovernor, CostLedger, DispatchStats, ModelTier,
    PriceTable,
};
use crate::logging::DispatchLogger;
use crate::resilience::{retry_with_backoff, RateLimitDecision, RateLimiter};
use crate::types::{DispatchError, Result};

const SESSION_SWEEP_PROBABILITY: f64 = 0.01;

/// A provider answer, before it is booked against the session.
struct Answer {
    index: usize,
    provider: String,
    response: ProviderResponse,
}

/// Routes each request through the providers, the cache and finally an
/// offline reply. Only `RateLimited` and `Cancelled` are ever returned as
/// errors.
pub struct Dispatcher {
    providers: Vec<Provider>,
    limiter: RateLimiter,
    cache: ResponseCache,
    governor: CostGovernor,
    prices: PriceTable,
    ledger: CostLedger,
    sessions: SessionStore,
    metrics: DispatchMetrics,
    offline_replies: Vec<String>,
    logger: DispatchLogger,
    deadline: Option<Duration>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Build a dispatcher with HTTP providers for every configured entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder()
            .rate_limit(config.rate_limits.dispatch.clone())
            .cache(config.cache.clone())
            .governor(config.governor.clone())
            .pricing(config.pricing.clone())
            .costs(config.costs.clone())
            .offline_replies(config.offline.replies.clone())
            .logging(config.logging.clone())
            .deadline(config.server.dispatch_deadline());

        for provider_config in &config.providers {
            let client = build_provider(provider_config)?;
            builder = builder.provider(Provider::from_config(provider_config, client));
        }

        builder.build()
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn governor(&self) -> &CostGovernor {
        &self.governor
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse> {
        self.dispatch_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Dispatch, abandoning provider calls and backoff sleeps once `cancel`
    /// fires. A cancelled request records nothing on any breaker.
    pub async fn dispatch_with_cancel(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResponse> {
        let decision = self.admit(&request.caller_key);
        if !decision.allowed {
            return Err(DispatchError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            });
        }
        self.dispatch_admitted(request, cancel).await
    }

    /// Run the chain for a request already admitted through [`admit`](Self::admit).
    pub async fn dispatch_admitted(
        &self,
        request: DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<DispatchResponse> {
        let response = self.run_chain(&request, &cancel).await;
        match &response {
            Ok(response) => self.logger.log_dispatch(&request, response),
            Err(DispatchError::Cancelled) => {
                self.metrics.record_cancelled();
                tracing::info!(session_id = %request.session_id, "Dispatch cancelled by caller");
            }
            Err(_) => {}
        }
        response
    }

    /// Rate-limit check on its own, for callers that need the decision details.
    pub fn admit(&self, caller_key: &str) -> RateLimitDecision {
        let decision = self.limiter.admit(caller_key);
        if decision.allowed {
            self.metrics.record_request();
        } else {
            self.metrics.record_rate_limited();
        }
        decision
    }

    async fn run_chain(
        &self,
        request: &DispatchRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        if rand::random::<f64>() < SESSION_SWEEP_PROBABILITY {
            self.sessions.sweep();
        }

        let session = self.sessions.handle(&request.session_id, || {
            self.governor.new_stats(request.session_id.clone())
        });
        let mut entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            entry = session.lock() => entry,
        };
        entry.last_seen = Instant::now();
        let tier = entry.stats.tier();

        let chain = self.try_providers(request, tier, cancel, &request_id);
        let outcome = match self.deadline {
            Some(limit) => tokio::select! {
                outcome = chain => outcome,
                _ = tokio::time::sleep_until(started + limit) => {
                    tracing::warn!(
                        request_id = %request_id,
                        deadline_ms = limit.as_millis() as u64,
                        "Dispatch deadline reached, abandoning providers"
                    );
                    Err(DispatchError::AllProvidersExhausted)
                }
            },
            None => chain.await,
        };

        let outcome = match outcome {
            Ok(answer) => {
                let cost_usd = self.settle(request, &answer, &mut entry.stats).await;
                Ok((answer, cost_usd))
            }
            Err(e) => Err(e),
        };
        drop(entry);

        let fell_back = !matches!(outcome, Ok((Answer { index: 0, .. }, _)));
        if fell_back && !matches!(outcome, Err(DispatchError::Cancelled)) {
            self.metrics.record_fallback();
        }

        let base = |text: String, source: ResponseSource| DispatchResponse {
            request_id: request_id.clone(),
            text,
            source,
            provider: None,
            model: None,
            success: false,
            cached: false,
            similar: false,
            offline: false,
            cost_usd: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
            tier,
        };

        match outcome {
            Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
            Ok((answer, cost_usd)) => {
                self.metrics.record_success();
                if answer.index > 0 {
                    self.metrics.record_recovery();
                }
                return Ok(DispatchResponse {
                    provider: Some(answer.provider),
                    model: Some(answer.response.model),
                    success: true,
                    cost_usd,
                    ..base(answer.response.text, ResponseSource::Provider)
                });
            }
            Err(_) => {}
        }

        if let Some(text) = self.cache.get(&request.query) {
            tracing::info!(request_id = %request_id, "All providers exhausted, serving cached answer");
            self.metrics.record_cache_hit();
            self.metrics.record_recovery();
            return Ok(DispatchResponse {
                cached: true,
                ..base(text, ResponseSource::Cache)
            });
        }

        if let Some(hit) = self.cache.find_similar(&request.query) {
            tracing::info!(
                request_id = %request_id,
                similarity = hit.similarity,
                "All providers exhausted, serving similar cached answer"
            );
            self.metrics.record_cache_hit();
            self.metrics.record_recovery();
            return Ok(DispatchResponse {
                cached: true,
                similar: true,
                ..base(hit.value, ResponseSource::SimilarCache)
            });
        }

        tracing::warn!(request_id = %request_id, "No provider or cache answer, replying offline");
        self.metrics.record_failure();
        Ok(DispatchResponse {
            offline: true,
            ..base(self.offline_reply(), ResponseSource::Offline)
        })
    }

    /// Walk the providers in priority order. Fails with `AllProvidersExhausted`
    /// when none answered, or `Cancelled`.
    async fn try_providers(
        &self,
        request: &DispatchRequest,
        tier: ModelTier,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<Answer> {
        for (index, provider) in self.providers.iter().enumerate() {
            match self
                .call_provider(provider, request, tier, cancel, request_id)
                .await
            {
                Ok(response) => {
                    return Ok(Answer {
                        index,
                        provider: provider.id().to_string(),
                        response,
                    })
                }
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(e @ DispatchError::CircuitOpen(_)) => {
                    tracing::debug!(request_id = %request_id, error = %e, "Skipping provider");
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %provider.id(),
                        request_id = %request_id,
                        error = %e,
                        "Provider failed, trying next source"
                    );
                }
            }
        }

        Err(DispatchError::AllProvidersExhausted)
    }

    /// One provider's retry run behind its breaker. The breaker records one
    /// outcome per run, and none when the run is cancelled or abandoned.
    async fn call_provider(
        &self,
        provider: &Provider,
        request: &DispatchRequest,
        tier: ModelTier,
        cancel: &CancellationToken,
        request_id: &str,
    ) -> Result<ProviderResponse> {
        let permit = provider
            .breaker()
            .try_acquire()
            .ok_or_else(|| DispatchError::CircuitOpen(provider.id().to_string()))?;

        let provider_request = ProviderRequest {
            query: request.query.clone(),
            payload: request.payload.clone(),
            model: provider
                .model_for(tier, self.governor.config())
                .to_string(),
        };
        let call = &provider_request;
        let client: &dyn ProviderClient = provider.client().as_ref();
        let provider_id = provider.id();
        let timeout = provider.timeout();

        let result = retry_with_backoff(
            provider_id,
            provider.retry(),
            timeout,
            cancel,
            move |attempt| {
                tracing::debug!(
                    provider = %provider_id,
                    request_id = %request_id,
                    attempt = attempt,
                    model = %call.model,
                    "Calling provider"
                );
                guarded_call(client, provider_id, call, timeout)
            },
        )
        .await;

        match result {
            Ok(response) => {
                permit.record_success();
                Ok(response)
            }
            Err(DispatchError::Cancelled) => {
                drop(permit);
                Err(DispatchError::Cancelled)
            }
            Err(e) => {
                permit.record_failure();
                Err(e)
            }
        }
    }

    /// Book a successful provider answer: cost log, governor and cache.
    async fn settle(
        &self,
        request: &DispatchRequest,
        answer: &Answer,
        stats: &mut DispatchStats,
    ) -> f64 {
        let response = &answer.response;
        let usage = response.usage;
        let cost_usd = self
            .prices
            .estimate(&response.model, usage.input_tokens, usage.output_tokens);

        self.ledger
            .record(CostEvent {
                ts: chrono::Utc::now(),
                session_id: request.session_id.clone(),
                provider: answer.provider.clone(),
                model: response.model.clone(),
                latency_ms: response.latency_ms,
                tokens_in: usage.input_tokens,
                tokens_out: usage.output_tokens,
                cost_usd,
            })
            .await;

        self.governor.observe(
            stats,
            response.latency_ms,
            usage.input_tokens,
            usage.output_tokens,
        );
        self.cache.insert(&request.query, response.text.clone());

        cost_usd
    }

    fn offline_reply(&self) -> String {
        self.offline_replies
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let counters = self.metrics.counters();
        let breakers: Vec<_> = self
            .providers
            .iter()
            .map(|p| p.breaker().snapshot())
            .collect();
        let breaker_states: BTreeMap<_, _> = breakers
            .iter()
            .map(|b| (b.provider_id.clone(), b.state))
            .collect();

        MetricsSnapshot {
            counters,
            success_rate: counters.success_rate(),
            cache_hit_rate: counters.cache_hit_rate(),
            recovery_rate: counters.recovery_rate(),
            breaker_states,
            breakers,
            cache_entries: self.cache.len(),
            active_sessions: self.sessions.len(),
            rate_limited_keys: self.limiter.stats().tracked_keys,
            costs: self.ledger.totals(),
            budget: self.ledger.budget_status(),
        }
    }

    /// Force a provider's breaker back to CLOSED.
    pub fn reset_breaker(&self, provider_id: &str) -> Result<()> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.id() == provider_id)
            .ok_or_else(|| DispatchError::UnknownProvider(provider_id.to_string()))?;
        provider.breaker().reset();
        Ok(())
    }
}

/// Call the provider, turning a panic inside the adapter into a provider error.
async fn guarded_call(
    client: &dyn ProviderClient,
    provider_id: &str,
    request: &ProviderRequest,
    timeout: Duration,
) -> Result<ProviderResponse> {
    match AssertUnwindSafe(client.call(request, timeout))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(provider = %provider_id, panic = %message, "Provider adapter panicked");
            Err(DispatchError::Provider {
                provider: provider_id.to_string(),
                message: format!("adapter panicked: {}", message),
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct DispatcherBuilder {
    providers: Vec<Provider>,
    rate_limit: RateLimitConfig,
    cache: CacheConfig,
    governor: GovernorConfig,
    pricing: HashMap<String, ModelPrice>,
    costs: CostsConfig,
    offline_replies: Vec<String>,
    logging: LoggingConfig,
    on_budget_alert: Option<AlertCallback>,
    deadline: Option<Duration>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            rate_limit: RateLimitConfig::general(),
            cache: CacheConfig::default(),
            governor: GovernorConfig::default(),
            pricing: default_pricing(),
            costs: CostsConfig::default(),
            offline_replies: default_offline_replies(),
            logging: LoggingConfig::default(),
            on_budget_alert: None,
            deadline: None,
        }
    }
}

impl DispatcherBuilder {
    pub fn provider(mut self, provider: Provider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn governor(mut self, config: GovernorConfig) -> Self {
        self.governor = config;
        self
    }

    pub fn pricing(mut self, prices: HashMap<String, ModelPrice>) -> Self {
        self.pricing = prices;
        self
    }

    pub fn costs(mut self, config: CostsConfig) -> Self {
        self.costs = config;
        self
    }

    pub fn offline_replies(mut self, replies: Vec<String>) -> Self {
        self.offline_replies = replies;
        self
    }

    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = config;
        self
    }

    pub fn on_budget_alert(mut self, callback: AlertCallback) -> Self {
        self.on_budget_alert = Some(callback);
        self
    }

    /// Upper bound on the provider stage of one request. When it passes, the
    /// remaining attempts are dropped and the cache and offline stages answer.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        if self.providers.is_empty() {
            return Err(DispatchError::Config(
                "Dispatcher needs at least one provider".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id()) {
                return Err(DispatchError::Config(format!(
                    "Duplicate provider id '{}'",
                    provider.id()
                )));
            }
        }

        let mut providers = self.providers;
        providers.sort_by_key(|p| p.priority());

        let mut budget = BudgetMonitor::new(self.costs.budget.clone());
        if let Some(callback) = self.on_budget_alert {
            budget = budget.with_callback(callback);
        }
        let ledger = CostLedger::new(self.costs.log_dir.as_ref().map(PathBuf::from), budget);
        let prices = PriceTable::new(self.pricing).with_fallback(self.governor.model_low.clone());

        let offline_replies = if self.offline_replies.is_empty() {
            default_offline_replies()
        } else {
            self.offline_replies
        };

        tracing::info!(
            providers = ?providers.iter().map(|p| p.id()).collect::<Vec<_>>(),
            "Dispatcher ready"
        );

        Ok(Dispatcher {
            providers,
            limiter: RateLimiter::new(self.rate_limit),
            cache: ResponseCache::new(self.cache),
            sessions: SessionStore::new(self.governor.session_idle()),
            governor: CostGovernor::new(self.governor),
            prices,
            ledger,
            metrics: DispatchMetrics::default(),
            offline_replies,
            logger: DispatchLogger::new(self.logging),
            deadline: self.deadline,
        })
    }
}
