pub mod file_store;
#[cfg(feature = "sqlite")]
pub mod sql_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::compressor::Summary;
use crate::config::MemoryConfig;
use crate::error::MemoryError;
use crate::types::Message;

/// Durable persistence for a `MemoryManager`'s state, keyed by session id.
/// Two backends ship with this crate (`file_store::FileSessionStore` and,
/// behind the `sqlite` feature, `sql_store::SqlSessionStore`); both produce
/// identical `LoadedSession` shapes so callers can swap backends freely.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a new session and returns its id (a UUID v4 string).
    async fn create_session(&self, metadata: Option<Map<String, Value>>, config: Option<&MemoryConfig>) -> Result<String, MemoryError>;

    /// Appends a single message, recording its token count.
    async fn save_message(&self, session_id: &str, message: &Message, tokens: u64) -> Result<(), MemoryError>;

    /// Replaces the entire system/short-term message set for a session in
    /// one call (the manager's common "flush current state" path).
    async fn save_memory(&self, session_id: &str, system_messages: &[Message], messages: &[Message]) -> Result<(), MemoryError>;

    async fn save_summary(&self, session_id: &str, summary: &Summary) -> Result<(), MemoryError>;

    /// Overwrites a session's metadata in place, bumping `updated_at`.
    /// Returns `false` if the session does not exist.
    async fn update_session_metadata(&self, session_id: &str, metadata: Map<String, Value>) -> Result<bool, MemoryError>;

    async fn load_session(&self, session_id: &str) -> Result<Option<LoadedSession>, MemoryError>;

    async fn list_sessions(&self, limit: usize, offset: usize) -> Result<Vec<SessionListEntry>, MemoryError>;

    async fn delete_session(&self, session_id: &str) -> Result<bool, MemoryError>;

    /// Id of the session with the most recent `updated_at`, if any exist.
    async fn find_latest_session(&self) -> Result<Option<String>, MemoryError>;

    /// Id of the unique session whose id starts with `prefix`, if exactly
    /// one match exists.
    async fn find_session_by_prefix(&self, prefix: &str) -> Result<Option<String>, MemoryError>;

    async fn get_session_stats(&self, session_id: &str) -> Result<Option<SessionStats>, MemoryError>;
}

#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub metadata: Map<String, Value>,
    pub config: Option<MemoryConfig>,
    pub system_messages: Vec<Message>,
    pub messages: Vec<Message>,
    pub summaries: Vec<Summary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionListEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub message_count: usize,
    pub system_message_count: usize,
    pub summary_count: usize,
    pub compression_count: u32,
    /// First user message's text, truncated for display in a session picker.
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub message_count: usize,
    pub system_message_count: usize,
    pub summary_count: usize,
    pub compression_count: u32,
    pub current_tokens: u64,
    pub total_original_tokens: u64,
    pub total_compressed_tokens: u64,
    pub token_savings: i64,
}

fn first_user_preview(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .find(|m| m.role == crate::types::Role::User)
        .map(|m| m.extract_text())
}
