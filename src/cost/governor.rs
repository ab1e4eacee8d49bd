//! Adaptive model-tier selection with hysteresis.
//!
//! Downgrading HIGH -> LOW needs only one bad signal (slow on average OR heavy
//! token use); upgrading LOW -> HIGH needs both signals to be comfortably low.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::config::GovernorConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    High,
    Low,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::High => write!(f, "high"),
            ModelTier::Low => write!(f, "low"),
        }
    }
}

/// Rolling per-session statistics.
#[derive(Debug, Clone)]
pub struct DispatchStats {
    session_id: String,
    latencies_ms: VecDeque<u64>,
    token_totals: VecDeque<u64>,
    tier: ModelTier,
    window: usize,
}

impl DispatchStats {
    pub fn new(session_id: impl Into<String>, tier: ModelTier, window: usize) -> Self {
        let window = window.max(1);
        Self {
            session_id: session_id.into(),
            latencies_ms: VecDeque::with_capacity(window),
            token_totals: VecDeque::with_capacity(window),
            tier,
            window,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tier(&self) -> ModelTier {
        self.tier
    }

    pub fn samples(&self) -> usize {
        self.latencies_ms.len()
    }

    fn record(&mut self, latency_ms: u64, total_tokens: u64) {
        push_bounded(&mut self.latencies_ms, latency_ms, self.window);
        push_bounded(&mut self.token_totals, total_tokens, self.window);
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies_ms.iter().sum();
        Some(sum as f64 / self.latencies_ms.len() as f64)
    }

    pub fn token_sum(&self) -> u64 {
        self.token_totals.iter().sum()
    }
}

fn push_bounded(buffer: &mut VecDeque<u64>, value: u64, window: usize) {
    if buffer.len() == window {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSwitch {
    pub from: ModelTier,
    pub to: ModelTier,
    pub avg_latency_ms: f64,
    pub token_sum: u64,
}

pub struct CostGovernor {
    config: GovernorConfig,
}

impl CostGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Fresh statistics for a session, starting on the configured tier.
    pub fn new_stats(&self, session_id: impl Into<String>) -> DispatchStats {
        DispatchStats::new(session_id, self.config.initial_tier, self.config.window)
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        self.config.model_for(tier)
    }

    /// Fold one completed request into `stats` and re-evaluate the tier.
    pub fn observe(
        &self,
        stats: &mut DispatchStats,
        latency_ms: u64,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Option<TierSwitch> {
        stats.record(latency_ms, tokens_in.saturating_add(tokens_out));
        self.evaluate(stats)
    }

    pub fn evaluate(&self, stats: &mut DispatchStats) -> Option<TierSwitch> {
        let avg_latency = stats.avg_latency_ms()?;
        let token_sum = stats.token_sum();
        let c = &self.config;

        let target = match stats.tier {
            ModelTier::High
                if avg_latency > c.lat_high_ms as f64 || token_sum > c.tok_high =>
            {
                ModelTier::Low
            }
            ModelTier::Low if avg_latency < c.lat_low_ms as f64 && token_sum < c.tok_low => {
                ModelTier::High
            }
            _ => return None,
        };

        let switch = TierSwitch {
            from: stats.tier,
            to: target,
            avg_latency_ms: avg_latency,
            token_sum,
        };
        stats.tier = target;

        tracing::info!(
            session_id = %stats.session_id,
            from = %switch.from,
            to = %switch.to,
            model = %self.model_for(target),
            avg_latency_ms = avg_latency.round() as u64,
            token_sum = token_sum,
            "Switching model tier"
        );

        Some(switch)
    }
}

impl Default for CostGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expensive_events_downgrade() {
        let governor = CostGovernor::default();
        let mut stats = governor.new_stats("s1");
        assert_eq!(stats.tier(), ModelTier::High);

        for _ in 0..3 {
            governor.observe(&mut stats, 800, 150, 100);
        }
        assert_eq!(stats.tier(), ModelTier::Low);
    }

    #[test]
    fn test_cheap_events_upgrade() {
        let governor = CostGovernor::default();
        let mut stats = DispatchStats::new("s1", ModelTier::Low, 10);

        governor.observe(&mut stats, 300, 40, 40);
        governor.observe(&mut stats, 250, 30, 20);
        assert_eq!(stats.tier(), ModelTier::High);
    }

    #[test]
    fn test_borderline_event_does_not_flip() {
        let governor = CostGovernor::default();
        let mut stats = governor.new_stats("s1");

        let switch = governor.observe(&mut stats, 650, 100, 100);
        assert!(switch.is_none());
        assert_eq!(stats.tier(), ModelTier::High);
    }

    #[test]
    fn test_token_sum_alone_downgrades() {
        let governor = CostGovernor::default();
        let mut stats = governor.new_stats("s1");

        let switch = governor
            .observe(&mut stats, 100, 500, 200)
            .expect("700 tokens should trigger a downgrade");
        assert_eq!(switch.from, ModelTier::High);
        assert_eq!(switch.to, ModelTier::Low);
        assert_eq!(switch.token_sum, 700);
    }

    #[test]
    fn test_upgrade_needs_both_signals() {
        let governor = CostGovernor::default();
        let mut stats = DispatchStats::new("s1", ModelTier::Low, 10);

        // Fast but token heavy
        governor.observe(&mut stats, 100, 150, 100);
        assert_eq!(stats.tier(), ModelTier::Low);
    }

    #[test]
    fn test_middle_band_holds_tier() {
        let governor = CostGovernor::default();
        let mut low = DispatchStats::new("s1", ModelTier::Low, 10);
        let mut high = DispatchStats::new("s2", ModelTier::High, 10);

        for _ in 0..5 {
            assert!(governor.observe(&mut low, 550, 10, 10).is_none());
            assert!(governor.observe(&mut high, 550, 10, 10).is_none());
        }
        assert_eq!(low.tier(), ModelTier::Low);
        assert_eq!(high.tier(), ModelTier::High);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let governor = CostGovernor::new(GovernorConfig {
            window: 3,
            ..GovernorConfig::default()
        });
        let mut stats = DispatchStats::new("s1", ModelTier::Low, 3);

        for latency in [900, 900, 900, 100, 100, 100] {
            governor.observe(&mut stats, latency, 10, 10);
        }
        assert_eq!(stats.samples(), 3);
        assert_eq!(stats.avg_latency_ms(), Some(100.0));
        assert_eq!(stats.token_sum(), 60);
        assert_eq!(stats.tier(), ModelTier::High);
    }
}
