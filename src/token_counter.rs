use std::collections::HashSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::types::{Block, Content, Message};

/// Per-million-token USD rates. Matched by first substring hit against the
/// requested model identifier — an ordered `Vec` rather than a `HashMap` so
/// lookup order (and therefore which entry wins when one model id is a
/// substring of another) is deterministic, mirroring the original
/// `TokenTracker.PRICING` dict's insertion-ordered iteration.
const PRICING: &[(&str, Pricing)] = &[
    ("gpt-4o-mini", Pricing { input: 0.15, output: 0.60 }),
    ("gpt-4o", Pricing { input: 2.50, output: 10.00 }),
    ("gpt-4-turbo", Pricing { input: 10.00, output: 30.00 }),
    ("claude-3-5-sonnet-20241022", Pricing { input: 3.00, output: 15.00 }),
    ("claude-3-5-haiku-20241022", Pricing { input: 0.80, output: 4.00 }),
    ("claude-3-opus-20240229", Pricing { input: 15.00, output: 75.00 }),
    ("gemini-1.5-pro", Pricing { input: 1.25, output: 5.00 }),
    ("gemini-1.5-flash", Pricing { input: 0.075, output: 0.30 }),
];

#[derive(Debug, Clone, Copy)]
struct Pricing {
    input: f64,
    output: f64,
}

fn lookup_pricing(model: &str) -> Option<Pricing> {
    PRICING
        .iter()
        .find(|(key, _)| model.contains(key))
        .map(|(_, p)| *p)
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetStatus {
    pub total_tokens: u64,
    pub max_tokens: u64,
    pub percentage: f64,
    pub remaining: u64,
    pub over_budget: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct NetSavings {
    pub net_tokens: i64,
    pub net_cost: f64,
    pub savings_percentage: f64,
    pub total_saved_tokens: u64,
    pub compression_overhead_tokens: u64,
}

/// Produces a token count for a `Message` under a `(provider, model)` pair,
/// with content-hash caching and authoritative usage accounting.
///
/// `count` is synchronous and must never suspend (spec §5); the cache is
/// guarded by a plain `Mutex` rather than threaded through `&mut self` so the
/// type can sit behind a shared reference if an embedder needs that, per the
/// "shared-resource policy" in §5 — ordinary single-threaded use through
/// `MemoryManager` never contends on it.
pub struct TokenCounter {
    cache: Mutex<std::collections::HashMap<String, u64>>,
    warned: Mutex<HashSet<(String, String)>>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub compression_savings: u64,
    pub compression_cost: u64,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(std::collections::HashMap::new()),
            warned: Mutex::new(HashSet::new()),
            total_input_tokens: 0,
            total_output_tokens: 0,
            compression_savings: 0,
            compression_cost: 0,
        }
    }

    /// Idempotent, pure w.r.t. inputs. Includes structural overhead for tool
    /// blocks (not just payload text) by hashing the full canonical
    /// serialization rather than just extracted text.
    pub fn count(&self, message: &Message, provider: &str, model: &str) -> u64 {
        let key = self.cache_key(message, provider, model);
        if let Some(&cached) = self.cache.lock().unwrap().get(&key) {
            return cached;
        }

        let tokens = self.estimate(message, provider, model);
        self.cache.lock().unwrap().insert(key, tokens);
        tokens
    }

    fn cache_key(&self, message: &Message, provider: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        match &message.content {
            None => hasher.update(b"none"),
            Some(Content::Text(s)) => hasher.update(s.as_bytes()),
            Some(Content::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        Block::Text { text } => hasher.update(text.as_bytes()),
                        Block::ToolUse { id, name, arguments } => {
                            hasher.update(id.as_bytes());
                            hasher.update(name.as_bytes());
                            hasher.update(serde_json::to_vec(arguments).unwrap_or_default());
                        }
                        Block::ToolResult { tool_use_id, content } => {
                            hasher.update(tool_use_id.as_bytes());
                            hasher.update(content.as_bytes());
                        }
                    }
                }
            }
        }
        if let Some(calls) = &message.tool_calls {
            hasher.update(serde_json::to_vec(calls).unwrap_or_default());
        }
        if let Some(id) = &message.tool_call_id {
            hasher.update(id.as_bytes());
        }
        if let Some(name) = &message.name {
            hasher.update(name.as_bytes());
        }
        let content_hash = format!("{:x}", hasher.finalize());
        format!("{:?}|{content_hash}|{provider}|{model}", message.role)
    }

    /// Falls back to the ~4-chars-per-token heuristic when no real tokenizer
    /// is registered for `(provider, model)`. This crate never imports
    /// tokenizer libraries directly (spec §9 "tokenizer pluggability") — a
    /// real deployment would route through an injected registry; absent one,
    /// every provider falls back and is warned about it exactly once.
    fn estimate(&self, message: &Message, provider: &str, model: &str) -> u64 {
        let key = (provider.to_string(), model.to_string());
        if self.warned.lock().unwrap().insert(key) {
            warn!(provider, model, "no tokenizer registered, using chars/4 heuristic");
        }

        let mut chars = message.extract_text().len();
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                chars += call.function.name.len() + call.function.arguments.len();
            }
        }
        (chars as u64).div_ceil(4)
    }

    pub fn record_usage(&mut self, input: u64, output: u64) {
        self.total_input_tokens += input;
        self.total_output_tokens += output;
    }

    pub fn add_compression_savings(&mut self, n: u64) {
        self.compression_savings += n;
    }

    pub fn add_compression_cost(&mut self, n: u64) {
        self.compression_cost += n;
    }

    pub fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let Some(pricing) = lookup_pricing(model) else {
            warn!(model, "no pricing found for model, returning 0");
            return 0.0;
        };
        (input_tokens as f64 * pricing.input + output_tokens as f64 * pricing.output) / 1_000_000.0
    }

    pub fn get_total_cost(&self, model: &str) -> f64 {
        self.calculate_cost(model, self.total_input_tokens, self.total_output_tokens)
    }

    pub fn get_net_savings(&self, model: &str) -> NetSavings {
        let net_tokens = self.compression_savings as i64 - self.compression_cost as i64;
        let saved_cost = self.calculate_cost(model, self.compression_savings, 0);
        let overhead_cost = self.calculate_cost(model, 0, self.compression_cost);
        let total_tokens = self.total_input_tokens + self.total_output_tokens;
        let savings_percentage = if total_tokens > 0 {
            net_tokens as f64 / total_tokens as f64 * 100.0
        } else {
            0.0
        };

        NetSavings {
            net_tokens,
            net_cost: saved_cost - overhead_cost,
            savings_percentage,
            total_saved_tokens: self.compression_savings,
            compression_overhead_tokens: self.compression_cost,
        }
    }

    pub fn get_budget_status(&self, max_tokens: u64) -> BudgetStatus {
        let total_tokens = self.total_input_tokens + self.total_output_tokens;
        let percentage = if max_tokens > 0 {
            total_tokens as f64 / max_tokens as f64 * 100.0
        } else {
            0.0
        };
        BudgetStatus {
            total_tokens,
            max_tokens,
            percentage,
            remaining: max_tokens.saturating_sub(total_tokens),
            over_budget: total_tokens > max_tokens,
        }
    }

    pub fn reset(&mut self) {
        self.cache.lock().unwrap().clear();
        self.warned.lock().unwrap().clear();
        self.total_input_tokens = 0;
        self.total_output_tokens = 0;
        self.compression_savings = 0;
        self.compression_cost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn count_is_idempotent_and_cached() {
        let counter = TokenCounter::new();
        let msg = Message::user("hello world");
        let a = counter.count(&msg, "anthropic", "claude-3-5-sonnet-20241022");
        let b = counter.count(&msg, "anthropic", "claude-3-5-sonnet-20241022");
        assert_eq!(a, b);
    }

    #[test]
    fn none_content_counts_zero() {
        let counter = TokenCounter::new();
        let msg = Message {
            role: crate::types::Role::User,
            content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        };
        assert_eq!(counter.count(&msg, "openai", "gpt-4o"), 0);
    }

    #[test]
    fn unknown_model_cost_is_zero_not_error() {
        let counter = TokenCounter::new();
        assert_eq!(counter.calculate_cost("some-unheard-of-model", 1000, 1000), 0.0);
    }

    #[test]
    fn scenario_2_no_double_counting() {
        let mut counter = TokenCounter::new();
        let _ = counter.count(&Message::user("hello"), "anthropic", "claude-3-5-sonnet-20241022");
        counter.record_usage(500, 80);
        assert_eq!(counter.total_input_tokens, 500);
        assert_eq!(counter.total_output_tokens, 80);
    }

    #[test]
    fn reset_clears_everything() {
        let mut counter = TokenCounter::new();
        counter.record_usage(10, 10);
        counter.add_compression_savings(5);
        counter.reset();
        assert_eq!(counter.total_input_tokens, 0);
        assert_eq!(counter.compression_savings, 0);
    }
}
