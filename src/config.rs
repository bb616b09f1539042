use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// The named algorithm the Compressor uses to turn a run of messages into a
/// `Summary`. `Hierarchical` is reserved: no auto-selection path or Manager
/// operation currently produces it (spec Open Question 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    Deletion,
    SlidingWindow,
    Selective,
    Hierarchical,
}

fn default_max_context_tokens() -> u32 {
    100_000
}

fn default_target_working_memory_tokens() -> u32 {
    50_000
}

fn default_compression_threshold() -> u32 {
    40_000
}

fn default_short_term_message_count() -> usize {
    20
}

fn default_compression_ratio() -> f64 {
    0.3
}

fn default_true() -> bool {
    true
}

fn default_recency_window() -> usize {
    2
}

/// Configuration for the memory management system. Constructed directly in
/// code (the engine never reads environment variables or files itself — see
/// `SPEC_FULL.md` §10) or deserialized from an application's own config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_target_working_memory_tokens")]
    pub target_working_memory_tokens: u32,
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u32,

    #[serde(default = "default_short_term_message_count")]
    pub short_term_message_count: usize,

    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f64,
    #[serde(default = "default_true")]
    pub preserve_tool_calls: bool,
    #[serde(default = "default_true")]
    pub preserve_system_prompts: bool,
    #[serde(default)]
    pub protected_tools: HashSet<String>,
    #[serde(default = "default_recency_window")]
    pub recency_window: usize,

    #[serde(default)]
    pub max_cost_dollars: Option<f64>,

    #[serde(default = "default_true")]
    pub enable_compression: bool,
    #[serde(default)]
    pub compression_model: Option<String>,
    #[serde(default)]
    pub strategy: Option<CompressionStrategy>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            target_working_memory_tokens: default_target_working_memory_tokens(),
            compression_threshold: default_compression_threshold(),
            short_term_message_count: default_short_term_message_count(),
            compression_ratio: default_compression_ratio(),
            preserve_tool_calls: true,
            preserve_system_prompts: true,
            protected_tools: HashSet::new(),
            recency_window: default_recency_window(),
            max_cost_dollars: None,
            enable_compression: true,
            compression_model: None,
            strategy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.max_context_tokens, 100_000);
        assert_eq!(cfg.target_working_memory_tokens, 50_000);
        assert_eq!(cfg.compression_threshold, 40_000);
        assert_eq!(cfg.short_term_message_count, 20);
        assert!((cfg.compression_ratio - 0.3).abs() < f64::EPSILON);
        assert!(cfg.preserve_tool_calls);
        assert!(cfg.preserve_system_prompts);
        assert!(cfg.protected_tools.is_empty());
        assert!(cfg.enable_compression);
    }

    #[test]
    fn deserializes_with_partial_overrides() {
        let cfg: MemoryConfig = serde_yaml::from_str("short_term_message_count: 6\n").unwrap();
        assert_eq!(cfg.short_term_message_count, 6);
        assert_eq!(cfg.max_context_tokens, 100_000);
    }
}
