//! Usage accounting (spec §4.M). Every LLM invocation attaches a
//! per-run callback that extracts token counts from the provider's
//! response envelope, prices them against a static model table, and
//! appends an immutable [`UsageRecord`] to a process-wide ledger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// `(input_per_M, output_per_M, cached_input_per_M)` in USD, keyed by the
/// longest matching substring of the model name. Unknown models fall back
/// to `DEFAULT_PRICING`.
const MODEL_PRICING: &[(&str, (f64, f64, f64))] = &[
    ("claude-opus-4", (15.0, 75.0, 1.5)),
    ("claude-sonnet-4", (3.0, 15.0, 0.3)),
    ("claude-3-7-sonnet", (3.0, 15.0, 0.3)),
    ("claude-3-5-sonnet", (3.0, 15.0, 0.3)),
    ("claude-3-5-haiku", (0.8, 4.0, 0.08)),
    ("claude-3-haiku", (0.25, 1.25, 0.03)),
    ("gpt-4o-mini", (0.15, 0.6, 0.075)),
    ("gpt-4o", (2.5, 10.0, 1.25)),
    ("gpt-4-turbo", (10.0, 30.0, 0.0)),
    ("gemini-1.5-flash", (0.075, 0.3, 0.0)),
    ("gemini-1.5-pro", (1.25, 5.0, 0.0)),
    ("gemini-2.0-flash", (0.1, 0.4, 0.0)),
];

const DEFAULT_PRICING: (f64, f64, f64) = (3.0, 15.0, 0.3);

/// Looks up `(input_per_M, output_per_M, cached_input_per_M)` for a model
/// name using longest-substring match; falls back to [`DEFAULT_PRICING`].
fn pricing_for(model: &str) -> (f64, f64, f64) {
    MODEL_PRICING
        .iter()
        .filter(|(needle, _)| model.contains(needle))
        .max_by_key(|(needle, _)| needle.len())
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICING)
}

pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64 {
    let (input_per_m, output_per_m, cached_per_m) = pricing_for(model);
    let billable_input = input_tokens.saturating_sub(cached_tokens);
    (billable_input as f64 / 1_000_000.0) * input_per_m
        + (output_tokens as f64 / 1_000_000.0) * output_per_m
        + (cached_tokens as f64 / 1_000_000.0) * cached_per_m
}

/// Tokens extracted from a provider response envelope, tolerating the
/// multiple key aliases different providers use (spec §6).
#[derive(Debug, Clone, Default)]
pub struct ExtractedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub model: Option<String>,
}

/// Reads token counts from a raw JSON provider response envelope, trying
/// each alias in order. Never panics or errors — extraction failures
/// simply leave the corresponding field at zero/`None`.
pub fn extract_usage(envelope: &Value) -> ExtractedUsage {
    fn first_u64(envelope: &Value, paths: &[&[&str]]) -> u64 {
        for path in paths {
            let mut cur = envelope;
            let mut ok = true;
            for key in *path {
                match cur.get(key) {
                    Some(v) => cur = v,
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                if let Some(n) = cur.as_u64() {
                    return n;
                }
            }
        }
        0
    }

    let input_tokens = first_u64(
        envelope,
        &[
            &["token_usage", "prompt_tokens"],
            &["usage", "prompt_tokens"],
            &["usage", "input_tokens"],
        ],
    );
    let output_tokens = first_u64(
        envelope,
        &[
            &["token_usage", "completion_tokens"],
            &["usage", "completion_tokens"],
            &["usage", "output_tokens"],
        ],
    );
    let cached_tokens = first_u64(
        envelope,
        &[
            &["usage", "cache_read_input_tokens"],
            &["prompt_tokens_details", "cached_tokens"],
        ],
    );
    let model = envelope
        .get("llm_output")
        .and_then(|o| o.get("model_name").or_else(|| o.get("model")))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    ExtractedUsage {
        input_tokens,
        output_tokens,
        cached_tokens,
        model,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub conversation_id: String,
    pub user_id: String,
    pub model: String,
    pub tier: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub call_count: u64,
}

impl UsageTotals {
    fn accumulate(&mut self, record: &UsageRecord) {
        self.total_input_tokens += record.input_tokens;
        self.total_output_tokens += record.output_tokens;
        self.total_cached_tokens += record.cached_tokens;
        self.total_tokens += record.input_tokens + record.output_tokens;
        self.total_cost_usd += record.cost_usd;
        self.call_count += 1;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub by_model: HashMap<String, UsageTotals>,
    pub by_tier: HashMap<String, UsageTotals>,
}

/// Process-wide, mutex-guarded usage ledger. Construct one per process and
/// share it via `Arc`; `record` is called from every LLM invocation site.
#[derive(Clone)]
pub struct UsageTracker {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Extracts usage from a raw response envelope and appends a record.
    /// Never raises — on extraction errors the record is simply skipped.
    pub fn record_from_envelope(
        &self,
        conversation_id: &str,
        user_id: &str,
        tier: &str,
        provider: &str,
        envelope: &Value,
    ) {
        let extracted = extract_usage(envelope);
        let Some(model) = extracted.model else {
            tracing::debug!("usage envelope missing model name, skipping record");
            return;
        };
        self.record(
            conversation_id,
            user_id,
            &model,
            tier,
            provider,
            extracted.input_tokens,
            extracted.output_tokens,
            extracted.cached_tokens,
        );
    }

    /// Appends a usage record directly from already-normalized counts
    /// (the common path when the caller already has a typed `Usage`).
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        conversation_id: &str,
        user_id: &str,
        model: &str,
        tier: &str,
        provider: &str,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    ) {
        let cost_usd = calculate_cost(model, input_tokens, output_tokens, cached_tokens);
        let record = UsageRecord {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            tier: tier.to_string(),
            provider: provider.to_string(),
            input_tokens,
            output_tokens,
            cached_tokens,
            cost_usd,
            timestamp: Utc::now(),
        };
        self.records.lock().push(record);
    }

    pub fn get_usage_summary(
        &self,
        conversation_id: Option<&str>,
        user_id: Option<&str>,
    ) -> UsageSummary {
        let records = self.records.lock();
        let mut summary = UsageSummary::default();
        for record in records.iter() {
            if let Some(cid) = conversation_id {
                if record.conversation_id != cid {
                    continue;
                }
            }
            if let Some(uid) = user_id {
                if record.user_id != uid {
                    continue;
                }
            }
            summary.totals.accumulate(record);
            summary
                .by_model
                .entry(record.model.clone())
                .or_default()
                .accumulate(record);
            summary
                .by_tier
                .entry(record.tier.clone())
                .or_default()
                .accumulate(record);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn longest_substring_match_wins() {
        let (input, output, _) = pricing_for("claude-3-5-sonnet-20241022");
        assert_eq!((input, output), (3.0, 15.0));
        let (input, output, _) = pricing_for("claude-3-5-haiku-20241022");
        assert_eq!((input, output), (0.8, 4.0));
    }

    #[test]
    fn unknown_model_falls_back_to_default_pricing() {
        assert_eq!(pricing_for("some-unreleased-model"), DEFAULT_PRICING);
    }

    #[test]
    fn cached_tokens_discounted_from_billable_input() {
        let cost = calculate_cost("claude-3-5-sonnet", 1000, 0, 1000);
        // entire input was cached: no full-price input cost, only cached rate
        let expected = (1000.0 / 1_000_000.0) * 0.3;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn extracts_usage_from_anthropic_style_envelope() {
        let envelope = json!({
            "usage": {"input_tokens": 120, "output_tokens": 45, "cache_read_input_tokens": 20},
            "llm_output": {"model_name": "claude-3-5-sonnet-20241022"},
        });
        let extracted = extract_usage(&envelope);
        assert_eq!(extracted.input_tokens, 120);
        assert_eq!(extracted.output_tokens, 45);
        assert_eq!(extracted.cached_tokens, 20);
        assert_eq!(extracted.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
    }

    #[test]
    fn extracts_usage_from_token_usage_alias() {
        let envelope = json!({
            "token_usage": {"prompt_tokens": 80, "completion_tokens": 30},
            "llm_output": {"model": "gpt-4o-mini"},
        });
        let extracted = extract_usage(&envelope);
        assert_eq!(extracted.input_tokens, 80);
        assert_eq!(extracted.output_tokens, 30);
        assert_eq!(extracted.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn malformed_envelope_does_not_panic() {
        let envelope = json!({"garbage": true});
        let extracted = extract_usage(&envelope);
        assert_eq!(extracted.input_tokens, 0);
        assert!(extracted.model.is_none());
    }

    #[test]
    fn summary_aggregates_by_model_and_tier() {
        let tracker = UsageTracker::new();
        tracker.record("c1", "u1", "claude-3-5-sonnet", "pro", "anthropic", 100, 50, 0);
        tracker.record("c1", "u1", "claude-3-5-haiku", "flash", "anthropic", 200, 20, 0);
        tracker.record("c2", "u1", "claude-3-5-sonnet", "pro", "anthropic", 10, 10, 0);

        let summary = tracker.get_usage_summary(Some("c1"), None);
        assert_eq!(summary.totals.call_count, 2);
        assert_eq!(summary.by_model.len(), 2);
        assert_eq!(summary.by_tier["pro"].call_count, 1);

        let all = tracker.get_usage_summary(None, Some("u1"));
        assert_eq!(all.totals.call_count, 3);
    }
}
