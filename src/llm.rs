use async_trait::async_trait;

/// The engine's only dependency on an LLM adapter: a single summarization
/// call. Concrete provider adapters (HTTP clients for Anthropic/OpenAI/etc.)
/// are an external collaborator (spec §6) and live outside this crate.
#[async_trait]
pub trait CompressionLlm: Send + Sync {
    /// Summarize `prompt` (already formatted with the compression
    /// instructions and the messages to compress), targeting roughly
    /// `max_tokens` tokens of output. Returns the summary text.
    async fn summarize(&self, prompt: &str, max_tokens: u32) -> Result<String, String>;

    /// Identifies the model used for summarization, for cost accounting.
    /// Falls back to `model` when `compression_model` is unset in config.
    fn model_name(&self) -> &str;

    fn provider_name(&self) -> &str;
}
