use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::error;

use crate::config::{CompressionStrategy, MemoryConfig};
use crate::llm::CompressionLlm;
use crate::token_counter::TokenCounter;
use crate::types::Message;

const COMPRESSION_PROMPT_HEADER: &str = "You are a memory compression system. Summarize the following conversation messages while preserving:
1. Key decisions and outcomes
2. Important facts, data, and findings
3. Tool usage patterns and results
4. User intent and goals
5. Critical context needed for future interactions";

const COMPRESSION_FAILED_SENTINEL: &str = "[Compression failed, preserving key messages]";

/// The compressed representation of a message run. A first-class entity in
/// assembled context (spec §3), and directly persisted by `SessionStore`
/// implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub preserved_messages: Vec<Message>,
    pub original_message_count: usize,
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub ratio: f64,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn token_savings(&self) -> i64 {
        self.original_tokens as i64 - self.compressed_tokens as i64
    }

    pub fn savings_percentage(&self) -> f64 {
        if self.original_tokens == 0 {
            return 0.0;
        }
        self.token_savings() as f64 / self.original_tokens as f64 * 100.0
    }
}

/// Auto-selection rule (spec §4.3): if any message in the run carries tool
/// activity, use `selective`; else if the run is short, `deletion`; else
/// `sliding_window`.
pub fn auto_select_strategy(messages: &[Message]) -> CompressionStrategy {
    if messages.iter().any(Message::has_tool_activity) {
        CompressionStrategy::Selective
    } else if messages.len() < 5 {
        CompressionStrategy::Deletion
    } else {
        CompressionStrategy::SlidingWindow
    }
}

struct Pair {
    use_pos: usize,
    result_pos: usize,
    name: String,
}

/// Implements the selective-partition algorithm of spec §4.3, returning the
/// set of message indices to preserve verbatim. Invariant C1 — no matched
/// pair is ever split across preserved/compressible — is enforced by
/// iterating to a fixpoint at the end.
fn selective_partition(messages: &[Message], config: &MemoryConfig) -> HashSet<usize> {
    // Step 1: collect tool_use / tool_result positions.
    let mut use_positions: HashMap<String, (usize, String)> = HashMap::new(); // id -> (pos, name)
    let mut result_positions: Vec<(String, usize)> = Vec::new(); // id, pos (may repeat)

    for (pos, msg) in messages.iter().enumerate() {
        for tool_use in msg.tool_uses() {
            use_positions
                .entry(tool_use.id.to_string())
                .or_insert((pos, tool_use.name.to_string()));
        }
        for id in msg.tool_result_ids() {
            result_positions.push((id.to_string(), pos));
        }
    }

    // Step 2: match ids into pairs; unmatched halves are orphans.
    let mut pairs = Vec::new();
    let mut matched_use_ids: HashSet<String> = HashSet::new();
    let mut matched_result_positions: HashSet<usize> = HashSet::new();
    for (id, result_pos) in &result_positions {
        if let Some((use_pos, name)) = use_positions.get(id) {
            pairs.push(Pair {
                use_pos: *use_pos,
                result_pos: *result_pos,
                name: name.clone(),
            });
            matched_use_ids.insert(id.clone());
            matched_result_positions.insert(*result_pos);
        }
    }

    let mut orphan_positions: HashSet<usize> = HashSet::new();
    for (id, (pos, _)) in &use_positions {
        if !matched_use_ids.contains(id) {
            orphan_positions.insert(*pos);
        }
    }
    for (id, pos) in &result_positions {
        if !use_positions.contains_key(id) {
            orphan_positions.insert(*pos);
        }
    }

    // Step 3: protected pair subset. `preserve_tool_calls` (default true)
    // protects every matched pair; `protected_tools` additionally protects
    // specific tool names even if the broader flag were ever turned off.
    let is_protected = |name: &str| config.preserve_tool_calls || config.protected_tools.contains(name);

    // Step 4: initial preserved set.
    let mut preserved: HashSet<usize> = HashSet::new();
    if config.preserve_system_prompts {
        for (pos, msg) in messages.iter().enumerate() {
            if msg.role == crate::types::Role::System {
                preserved.insert(pos);
            }
        }
    }
    for pair in &pairs {
        if is_protected(&pair.name) {
            preserved.insert(pair.use_pos);
            preserved.insert(pair.result_pos);
        }
    }
    for &pos in &orphan_positions {
        preserved.insert(pos);
    }
    let recency_start = messages.len().saturating_sub(config.recency_window);
    for pos in recency_start..messages.len() {
        preserved.insert(pos);
    }

    // Step 6: fixpoint — promote the partner of any split matched pair.
    loop {
        let mut changed = false;
        for pair in &pairs {
            let use_in = preserved.contains(&pair.use_pos);
            let result_in = preserved.contains(&pair.result_pos);
            if use_in != result_in {
                preserved.insert(pair.use_pos);
                preserved.insert(pair.result_pos);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    preserved
}

fn format_messages_for_summary(messages: &[Message]) -> String {
    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| format!("[{}] {}: {}", i + 1, role_label(msg), msg.extract_text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn role_label(msg: &Message) -> &'static str {
    match msg.role {
        crate::types::Role::System => "SYSTEM",
        crate::types::Role::User => "USER",
        crate::types::Role::Assistant => "ASSISTANT",
        crate::types::Role::Tool => "TOOL",
    }
}

fn build_prompt(messages: &[Message], target_tokens: u32, todo_context: Option<&str>) -> String {
    let formatted = format_messages_for_summary(messages);
    let approx_tokens: usize = messages.iter().map(|m| m.extract_text().len() / 4).sum();
    let mut prompt = format!(
        "{COMPRESSION_PROMPT_HEADER}\n\nOriginal messages ({count} messages, ~{tokens} tokens):\n\n{formatted}\n\nProvide a concise but comprehensive summary that captures the essential information. Be specific and include concrete details. Target length: {target_tokens} tokens.",
        count = messages.len(),
        tokens = approx_tokens,
    );
    if let Some(todo) = todo_context {
        prompt.push_str(&format!("\n\nCurrent task list:\n{todo}"));
    }
    prompt
}

/// Transforms a contiguous run of messages into a `Summary`, honoring
/// Invariant M1 and the role policies of spec §4.3. Stateless beyond the
/// config it's handed per call.
pub struct Compressor;

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    pub fn new() -> Self {
        Self
    }

    pub async fn compress(
        &self,
        llm: &dyn CompressionLlm,
        counter: &TokenCounter,
        config: &MemoryConfig,
        messages: Vec<Message>,
        strategy: CompressionStrategy,
        target_tokens: u32,
        todo_context: Option<&str>,
    ) -> Summary {
        if messages.is_empty() {
            return Summary {
                text: String::new(),
                preserved_messages: Vec::new(),
                original_message_count: 0,
                original_tokens: 0,
                compressed_tokens: 0,
                ratio: 0.0,
                metadata: Map::new(),
                created_at: Utc::now(),
            };
        }

        match strategy {
            CompressionStrategy::Deletion => self.compress_deletion(counter, llm, messages),
            CompressionStrategy::SlidingWindow => {
                self.compress_sliding_window(llm, counter, messages, target_tokens, todo_context).await
            }
            CompressionStrategy::Selective => {
                self.compress_selective(llm, counter, config, messages, target_tokens, todo_context).await
            }
            CompressionStrategy::Hierarchical => {
                tracing::warn!("hierarchical strategy requested but has no implementation; falling back to sliding_window");
                self.compress_sliding_window(llm, counter, messages, target_tokens, todo_context).await
            }
        }
    }

    fn message_tokens(&self, counter: &TokenCounter, llm: &dyn CompressionLlm, messages: &[Message]) -> u64 {
        messages
            .iter()
            .map(|m| counter.count(m, llm.provider_name(), llm.model_name()))
            .sum()
    }

    fn compress_deletion(&self, counter: &TokenCounter, llm: &dyn CompressionLlm, messages: Vec<Message>) -> Summary {
        let original_tokens = self.message_tokens(counter, llm, &messages);
        Summary {
            text: String::new(),
            preserved_messages: Vec::new(),
            original_message_count: messages.len(),
            compressed_tokens: 0,
            original_tokens,
            ratio: 0.0,
            metadata: json_map(&[("strategy", json!("deletion"))]),
            created_at: Utc::now(),
        }
    }

    async fn compress_sliding_window(
        &self,
        llm: &dyn CompressionLlm,
        counter: &TokenCounter,
        messages: Vec<Message>,
        target_tokens: u32,
        todo_context: Option<&str>,
    ) -> Summary {
        let original_tokens = self.message_tokens(counter, llm, &messages);
        let prompt = build_prompt(&messages, target_tokens, todo_context);

        match llm.summarize(&prompt, target_tokens.saturating_mul(2)).await {
            Ok(summary_text) => {
                let compressed_tokens = counter.count(&Message::assistant(&summary_text), llm.provider_name(), llm.model_name());
                let ratio = if original_tokens > 0 {
                    compressed_tokens as f64 / original_tokens as f64
                } else {
                    0.0
                };
                Summary {
                    text: summary_text,
                    preserved_messages: Vec::new(),
                    original_message_count: messages.len(),
                    compressed_tokens,
                    original_tokens,
                    ratio,
                    metadata: json_map(&[("strategy", json!("sliding_window"))]),
                    created_at: Utc::now(),
                }
            }
            Err(e) => {
                error!(error = %e, "compression failed, falling back to first/last preservation");
                self.failed_summary(counter, llm, messages, original_tokens, "sliding_window", &e)
            }
        }
    }

    async fn compress_selective(
        &self,
        llm: &dyn CompressionLlm,
        counter: &TokenCounter,
        config: &MemoryConfig,
        messages: Vec<Message>,
        target_tokens: u32,
        todo_context: Option<&str>,
    ) -> Summary {
        let preserved_idx = selective_partition(&messages, config);
        let mut preserved = Vec::new();
        let mut to_compress = Vec::new();
        for (pos, msg) in messages.iter().enumerate() {
            if preserved_idx.contains(&pos) {
                preserved.push(msg.clone());
            } else {
                to_compress.push(msg.clone());
            }
        }

        let original_tokens = self.message_tokens(counter, llm, &messages);
        let preserved_tokens = self.message_tokens(counter, llm, &preserved);
        let preserved_count = preserved.len();

        if to_compress.is_empty() {
            return Summary {
                text: String::new(),
                preserved_messages: preserved,
                original_message_count: messages.len(),
                compressed_tokens: preserved_tokens,
                original_tokens,
                ratio: 1.0,
                metadata: json_map(&[("strategy", json!("selective"))]),
                created_at: Utc::now(),
            };
        }

        let available = (target_tokens as i64) - (preserved_tokens as i64);
        if available <= 0 {
            return Summary {
                text: String::new(),
                preserved_messages: preserved,
                original_message_count: messages.len(),
                compressed_tokens: preserved_tokens,
                original_tokens,
                ratio: if original_tokens > 0 {
                    preserved_tokens as f64 / original_tokens as f64
                } else {
                    1.0
                },
                metadata: json_map(&[("strategy", json!("selective")), ("preserved_count", json!(preserved_count))]),
                created_at: Utc::now(),
            };
        }

        let prompt = build_prompt(&to_compress, available as u32, todo_context);
        match llm.summarize(&prompt, (available as u32).saturating_mul(2)).await {
            Ok(summary_text) => {
                let summary_tokens = counter.count(&Message::assistant(&summary_text), llm.provider_name(), llm.model_name());
                let compressed_tokens = preserved_tokens + summary_tokens;
                let ratio = if original_tokens > 0 {
                    compressed_tokens as f64 / original_tokens as f64
                } else {
                    0.0
                };
                Summary {
                    text: summary_text,
                    preserved_messages: preserved,
                    original_message_count: messages.len(),
                    compressed_tokens,
                    original_tokens,
                    ratio,
                    metadata: json_map(&[("strategy", json!("selective")), ("preserved_count", json!(preserved_count))]),
                    created_at: Utc::now(),
                }
            }
            Err(e) => {
                error!(error = %e, "selective compression failed, preserving important messages only");
                Summary {
                    text: String::new(),
                    preserved_messages: preserved,
                    original_message_count: messages.len(),
                    compressed_tokens: preserved_tokens,
                    original_tokens,
                    ratio: if original_tokens > 0 {
                        preserved_tokens as f64 / original_tokens as f64
                    } else {
                        1.0
                    },
                    metadata: json_map(&[
                        ("strategy", json!("selective")),
                        ("error", json!(e)),
                    ]),
                    created_at: Utc::now(),
                }
            }
        }
    }

    fn failed_summary(
        &self,
        counter: &TokenCounter,
        llm: &dyn CompressionLlm,
        messages: Vec<Message>,
        original_tokens: u64,
        strategy: &str,
        error: &str,
    ) -> Summary {
        let preserved = if messages.len() > 1 {
            vec![messages[0].clone(), messages[messages.len() - 1].clone()]
        } else {
            messages.clone()
        };
        let compressed_tokens = self.message_tokens(counter, llm, &preserved);
        Summary {
            text: COMPRESSION_FAILED_SENTINEL.to_string(),
            preserved_messages: preserved,
            original_message_count: messages.len(),
            compressed_tokens,
            original_tokens,
            ratio: 0.5,
            metadata: json_map(&[("strategy", json!(strategy)), ("error", json!(error))]),
            created_at: Utc::now(),
        }
    }
}

fn json_map(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}
