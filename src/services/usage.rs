use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::config::ModelPrice;
use crate::services::inference::TokenUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub(crate) struct ModelUsage {
    pub(crate) calls: u32,
    pub(crate) input_tokens: u64,
    pub(crate) output_tokens: u64,
    pub(crate) total_tokens: u64,
    pub(crate) total_cost: f64,
}

/// Token and cost totals for one parse run, broken down per model.
#[derive(Debug, Clone, Default)]
pub(crate) struct UsageLedger {
    pricing: BTreeMap<String, ModelPrice>,
    models: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct UsageSummary {
    pub(crate) input_tokens: u64,
    pub(crate) output_tokens: u64,
    pub(crate) total_tokens: u64,
    pub(crate) total_cost: f64,
    pub(crate) models: BTreeMap<String, ModelUsage>,
}

impl UsageLedger {
    pub(crate) fn new(pricing: BTreeMap<String, ModelPrice>) -> Self {
        Self { pricing, models: BTreeMap::new() }
    }

    pub(crate) fn record(&mut self, model: &str, usage: TokenUsage) {
        let cost = self
            .pricing
            .get(model)
            .map(|price| {
                usage.input_tokens as f64 / 1_000_000.0 * price.input_per_million
                    + usage.output_tokens as f64 / 1_000_000.0 * price.output_per_million
            })
            .unwrap_or(0.0);

        let entry = self.models.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.total_tokens += usage.input_tokens + usage.output_tokens;
        entry.total_cost += cost;
    }

    pub(crate) fn summary(&self) -> UsageSummary {
        let mut summary = UsageSummary {
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            total_cost: 0.0,
            models: self.models.clone(),
        };
        for usage in self.models.values() {
            summary.input_tokens += usage.input_tokens;
            summary.output_tokens += usage.output_tokens;
            summary.total_tokens += usage.total_tokens;
            summary.total_cost += usage.total_cost;
        }
        summary.total_cost = round_cost(summary.total_cost);
        summary
    }
}

fn round_cost(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> BTreeMap<String, ModelPrice> {
        BTreeMap::from([(
            "gpt-5-mini".to_string(),
            ModelPrice { input_per_million: 0.25, output_per_million: 2.0 },
        )])
    }

    #[test]
    fn records_cost_per_model() {
        let mut ledger = UsageLedger::new(pricing());
        ledger.record("gpt-5-mini", TokenUsage { input_tokens: 1_000_000, output_tokens: 500_000 });
        ledger.record("gpt-5-mini", TokenUsage { input_tokens: 0, output_tokens: 0 });

        let summary = ledger.summary();
        let mini = summary.models["gpt-5-mini"];
        assert_eq!(mini.calls, 2);
        assert_eq!(mini.total_tokens, 1_500_000);
        assert!((summary.total_cost - 1.25).abs() < 1e-9);
    }

    #[test]
    fn unpriced_models_count_tokens_without_cost() {
        let mut ledger = UsageLedger::new(pricing());
        ledger.record("local-model", TokenUsage { input_tokens: 10, output_tokens: 5 });

        let summary = ledger.summary();
        assert_eq!(summary.total_tokens, 15);
        assert_eq!(summary.total_cost, 0.0);
    }
}
