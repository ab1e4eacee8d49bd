use std::collections::HashMap;

use crate::config::{default_pricing, ModelPrice};

/// Static per-model price table in USD per 1K tokens.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
    fallback_model: Option<String>,
}

impl PriceTable {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self {
            prices,
            fallback_model: None,
        }
    }

    /// Price unknown models like `model`.
    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    /// Exact match, then the longest configured name that prefixes `model`
    /// (dated snapshots such as `gpt-4o-2024-08-06`), then the fallback model.
    pub fn price_for(&self, model: &str) -> Option<ModelPrice> {
        if let Some(price) = self.prices.get(model) {
            return Some(*price);
        }

        let prefixed = self
            .prices
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| *price);

        prefixed.or_else(|| {
            self.fallback_model
                .as_ref()
                .and_then(|fallback| self.prices.get(fallback))
                .copied()
        })
    }

    /// Estimated cost in USD, rounded to six decimals. Unpriced models cost zero.
    pub fn estimate(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        let Some(price) = self.price_for(model) else {
            tracing::debug!(model = %model, "No price configured for model");
            return 0.0;
        };
        let cost = (tokens_in as f64 / 1000.0) * price.input_per_1k
            + (tokens_out as f64 / 1000.0) * price.output_per_1k;
        (cost * 1_000_000.0).round() / 1_000_000.0
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new(default_pricing()).with_fallback("gpt-4o-mini")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_known_model() {
        let table = PriceTable::default();
        // 1000 in * 0.0025 + 500 out * 0.01 / 1K
        let cost = table.estimate("gpt-4o", 1000, 500);
        assert!((cost - 0.0075).abs() < 1e-9);
    }

    #[test]
    fn test_dated_snapshot_uses_longest_prefix() {
        let table = PriceTable::default();
        let mini = table.price_for("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(mini.input_per_1k, 0.00015);

        let full = table.price_for("gpt-4o-2024-08-06").unwrap();
        assert_eq!(full.input_per_1k, 0.0025);
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let table = PriceTable::default();
        let price = table.price_for("mystery-model").unwrap();
        assert_eq!(price.output_per_1k, 0.0006);
    }

    #[test]
    fn test_unknown_model_without_fallback_is_free() {
        let table = PriceTable::new(default_pricing());
        assert_eq!(table.estimate("mystery-model", 10_000, 10_000), 0.0);
    }

    #[test]
    fn test_rounding_to_micro_dollars() {
        let table = PriceTable::default();
        let cost = table.estimate("gpt-4o-mini", 1, 1);
        assert_eq!(cost, 0.000001);
    }
}
