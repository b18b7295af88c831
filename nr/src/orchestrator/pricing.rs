//! Token cost estimation from configured pricing
//!
//! Pricing comes from the `NEWSRECAP_LLM_PRICING` environment mapping:
//! comma-separated `agent:model:input_per_1m:output_per_1m` entries, with
//! `*` wildcards allowed for agent and model.

use std::collections::HashMap;

pub const PRICING_ENV_VAR: &str = "NEWSRECAP_LLM_PRICING";

/// Per-model input/output pricing in USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

/// Estimate task cost in USD from token usage and configured pricing.
pub fn estimate_cost_usd(
    agent: &str,
    model: &str,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
) -> Option<f64> {
    let raw = std::env::var(PRICING_ENV_VAR).unwrap_or_default();
    estimate_cost_with_mapping(&raw, agent, model, prompt_tokens, completion_tokens, total_tokens)
}

/// Mapping-injected variant so pricing stays testable without env state.
pub fn estimate_cost_with_mapping(
    raw_mapping: &str,
    agent: &str,
    model: &str,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
) -> Option<f64> {
    let mapping = parse_pricing_mapping(raw_mapping);
    let pricing = lookup_pricing(&mapping, agent, model)?;

    if let (Some(prompt), Some(completion)) = (prompt_tokens, completion_tokens) {
        return Some(
            (prompt as f64 / 1_000_000.0) * pricing.input_per_1m
                + (completion as f64 / 1_000_000.0) * pricing.output_per_1m,
        );
    }
    total_tokens.map(|total| (total as f64 / 1_000_000.0) * pricing.input_per_1m)
}

fn lookup_pricing(
    mapping: &HashMap<(String, String), ModelPricing>,
    agent: &str,
    model: &str,
) -> Option<ModelPricing> {
    let agent = agent.trim().to_lowercase();
    let model = model.trim().to_string();
    mapping
        .get(&(agent.clone(), model))
        .or_else(|| mapping.get(&(agent, "*".to_string())))
        .or_else(|| mapping.get(&("*".to_string(), "*".to_string())))
        .copied()
}

fn parse_pricing_mapping(raw: &str) -> HashMap<(String, String), ModelPricing> {
    let mut parsed = HashMap::new();
    for entry in raw.split(',') {
        let value = entry.trim();
        if value.is_empty() {
            continue;
        }
        let parts: Vec<&str> = value.split(':').map(str::trim).collect();
        if parts.len() != 4 {
            continue;
        }
        let (Ok(input_per_1m), Ok(output_per_1m)) =
            (parts[2].parse::<f64>(), parts[3].parse::<f64>())
        else {
            continue;
        };
        parsed.insert(
            (parts[0].to_lowercase(), parts[1].to_string()),
            ModelPricing {
                input_per_1m,
                output_per_1m,
            },
        );
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPPING: &str = "codex:gpt-5-codex:1.25:10.0,codex:*:1.0:8.0,*:*:0.5:4.0";

    #[test]
    fn test_exact_match_uses_split_tokens() {
        let cost = estimate_cost_with_mapping(
            MAPPING,
            "codex",
            "gpt-5-codex",
            Some(1_000_000),
            Some(100_000),
            None,
        )
        .unwrap();
        assert!((cost - (1.25 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_wildcard_model_fallback() {
        let cost = estimate_cost_with_mapping(
            MAPPING,
            "codex",
            "gpt-5-codex-mini",
            Some(2_000_000),
            Some(0),
            None,
        )
        .unwrap();
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_global_wildcard_fallback() {
        let cost =
            estimate_cost_with_mapping(MAPPING, "claude", "opus", None, None, Some(1_000_000))
                .unwrap();
        assert!((cost - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_total_only_uses_input_rate() {
        let cost = estimate_cost_with_mapping(
            MAPPING,
            "codex",
            "gpt-5-codex",
            None,
            None,
            Some(4_000_000),
        )
        .unwrap();
        assert!((cost - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_mapping_means_no_estimate() {
        assert!(estimate_cost_with_mapping("", "codex", "gpt-5-codex", None, None, Some(1)).is_none());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mapping = "bad-entry,codex:gpt:not-a-number:2,codex:gpt:1.0:2.0";
        let cost =
            estimate_cost_with_mapping(mapping, "codex", "gpt", Some(1_000_000), Some(1_000_000), None)
                .unwrap();
        assert!((cost - 3.0).abs() < 1e-9);
    }
}
