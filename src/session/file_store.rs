use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compressor::Summary;
use crate::config::MemoryConfig;
use crate::error::MemoryError;
use crate::types::{Message, Role};

use super::{first_user_preview, LoadedSession, SessionListEntry, SessionStats, SessionStore};

const MANIFEST_FILE: &str = "session.yaml";
const MESSAGES_FILE: &str = "messages.yaml";
const SYSTEM_MESSAGES_FILE: &str = "system_messages.yaml";
const SUMMARIES_FILE: &str = "summaries.yaml";
const INDEX_FILE: &str = ".index.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    config: Option<MemoryConfig>,
    #[serde(default)]
    compression_count: u32,
}

/// Root index of known session ids, rewritten atomically alongside every
/// mutation so `list_sessions`/`find_*` don't need to scan the directory
/// tree. Mirrors the original `YamlFileMemoryStore`'s `.index.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SessionIndex {
    #[serde(default)]
    sessions: std::collections::BTreeMap<String, IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    message: Message,
    #[serde(default)]
    tokens: u64,
    timestamp: DateTime<Utc>,
}

/// One directory per session under `sessions_dir`, named by UUID. Each holds
/// a `session.yaml` manifest plus one YAML file per message category, plus a
/// root `.index.yaml` listing every session id so lookups don't need a
/// directory scan. Chosen over a single flat file per session so a human can
/// `ls`/`cat` a session's pieces independently, mirroring the original
/// `YamlFileMemoryStore`'s directory-tree layout.
pub struct FileSessionStore {
    sessions_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    async fn read_manifest(&self, session_id: &str) -> Result<Option<Manifest>, MemoryError> {
        let path = self.session_dir(session_id).join(MANIFEST_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_yaml::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<(), MemoryError> {
        write_yaml_atomic(&self.session_dir(&manifest.id).join(MANIFEST_FILE), manifest).await
    }

    async fn read_messages(&self, session_id: &str, file: &str) -> Result<Vec<StoredMessage>, MemoryError> {
        let path = self.session_dir(session_id).join(file);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_messages(&self, session_id: &str, file: &str, messages: &[StoredMessage]) -> Result<(), MemoryError> {
        write_yaml_atomic(&self.session_dir(session_id).join(file), messages).await
    }

    async fn read_summaries(&self, session_id: &str) -> Result<Vec<Summary>, MemoryError> {
        let path = self.session_dir(session_id).join(SUMMARIES_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Known session ids, sourced from the root index rather than a
    /// directory scan.
    async fn list_session_dirs(&self) -> Result<Vec<String>, MemoryError> {
        Ok(self.read_index().await?.sessions.into_keys().collect())
    }

    async fn read_index(&self) -> Result<SessionIndex, MemoryError> {
        let path = self.sessions_dir.join(INDEX_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SessionIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, index: &SessionIndex) -> Result<(), MemoryError> {
        write_yaml_atomic(&self.sessions_dir.join(INDEX_FILE), index).await
    }

    async fn upsert_index(&self, session_id: &str, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Result<(), MemoryError> {
        let mut index = self.read_index().await?;
        index.sessions.insert(session_id.to_string(), IndexEntry { created_at, updated_at });
        self.write_index(&index).await
    }

    async fn remove_from_index(&self, session_id: &str) -> Result<(), MemoryError> {
        let mut index = self.read_index().await?;
        if index.sessions.remove(session_id).is_some() {
            self.write_index(&index).await?;
        }
        Ok(())
    }
}

/// Writes YAML to `path` via a temp file + rename, so a reader never
/// observes a half-written manifest (the one integrity property a
/// flat-file-per-field layout actually needs).
async fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let yaml = serde_yaml::to_string(value)?;
    let tmp_path = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp_path, yaml).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(&self, metadata: Option<Map<String, Value>>, config: Option<&MemoryConfig>) -> Result<String, MemoryError> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let manifest = Manifest {
            id: session_id.clone(),
            created_at: now,
            updated_at: now,
            metadata: metadata.unwrap_or_default(),
            config: config.cloned(),
            compression_count: 0,
        };
        self.write_manifest(&manifest).await?;
        self.upsert_index(&manifest.id, manifest.created_at, manifest.updated_at).await?;
        info!(session_id, "created session");
        Ok(session_id)
    }

    async fn save_message(&self, session_id: &str, message: &Message, tokens: u64) -> Result<(), MemoryError> {
        let Some(mut manifest) = self.read_manifest(session_id).await? else {
            return Err(MemoryError::Persistence(format!("session {session_id} not found")));
        };

        let file = if message.role == Role::System { SYSTEM_MESSAGES_FILE } else { MESSAGES_FILE };
        let mut stored = self.read_messages(session_id, file).await?;
        stored.push(StoredMessage {
            message: message.clone(),
            tokens,
            timestamp: Utc::now(),
        });
        self.write_messages(session_id, file, &stored).await?;

        manifest.updated_at = Utc::now();
        self.write_manifest(&manifest).await?;
        self.upsert_index(&manifest.id, manifest.created_at, manifest.updated_at).await?;
        Ok(())
    }

    async fn save_memory(&self, session_id: &str, system_messages: &[Message], messages: &[Message]) -> Result<(), MemoryError> {
        let Some(mut manifest) = self.read_manifest(session_id).await? else {
            return Err(MemoryError::Persistence(format!("session {session_id} not found")));
        };
        let now = Utc::now();

        let stored_system: Vec<StoredMessage> = system_messages
            .iter()
            .map(|m| StoredMessage {
                message: m.clone(),
                tokens: 0,
                timestamp: now,
            })
            .collect();
        let stored_messages: Vec<StoredMessage> = messages
            .iter()
            .map(|m| StoredMessage {
                message: m.clone(),
                tokens: 0,
                timestamp: now,
            })
            .collect();

        self.write_messages(session_id, SYSTEM_MESSAGES_FILE, &stored_system).await?;
        self.write_messages(session_id, MESSAGES_FILE, &stored_messages).await?;

        manifest.updated_at = now;
        self.write_manifest(&manifest).await?;
        self.upsert_index(&manifest.id, manifest.created_at, manifest.updated_at).await?;
        debug!(session_id, system = stored_system.len(), messages = stored_messages.len(), "replaced session memory");
        Ok(())
    }

    async fn save_summary(&self, session_id: &str, summary: &Summary) -> Result<(), MemoryError> {
        let Some(mut manifest) = self.read_manifest(session_id).await? else {
            return Err(MemoryError::Persistence(format!("session {session_id} not found")));
        };
        let mut summaries = self.read_summaries(session_id).await?;
        summaries.push(summary.clone());
        write_yaml_atomic(&self.session_dir(session_id).join(SUMMARIES_FILE), &summaries).await?;

        manifest.compression_count += 1;
        manifest.updated_at = Utc::now();
        self.write_manifest(&manifest).await?;
        self.upsert_index(&manifest.id, manifest.created_at, manifest.updated_at).await?;
        Ok(())
    }

    async fn update_session_metadata(&self, session_id: &str, metadata: Map<String, Value>) -> Result<bool, MemoryError> {
        let Some(mut manifest) = self.read_manifest(session_id).await? else {
            return Ok(false);
        };
        manifest.metadata = metadata;
        manifest.updated_at = Utc::now();
        self.write_manifest(&manifest).await?;
        self.upsert_index(&manifest.id, manifest.created_at, manifest.updated_at).await?;
        Ok(true)
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<LoadedSession>, MemoryError> {
        let Some(manifest) = self.read_manifest(session_id).await? else {
            return Ok(None);
        };
        let system_messages = self.read_messages(session_id, SYSTEM_MESSAGES_FILE).await?.into_iter().map(|s| s.message).collect();
        let messages = self.read_messages(session_id, MESSAGES_FILE).await?.into_iter().map(|s| s.message).collect();
        let summaries = self.read_summaries(session_id).await?;

        Ok(Some(LoadedSession {
            metadata: manifest.metadata,
            config: manifest.config,
            system_messages,
            messages,
            summaries,
            created_at: manifest.created_at,
            updated_at: manifest.updated_at,
        }))
    }

    async fn list_sessions(&self, limit: usize, offset: usize) -> Result<Vec<SessionListEntry>, MemoryError> {
        let ids = self.list_session_dirs().await?;
        let mut entries = Vec::new();
        for id in ids {
            let Some(manifest) = self.read_manifest(&id).await? else {
                warn!(session_id = %id, "session directory missing manifest, skipping");
                continue;
            };
            let system_messages = self.read_messages(&id, SYSTEM_MESSAGES_FILE).await?;
            let messages = self.read_messages(&id, MESSAGES_FILE).await?;
            let summaries = self.read_summaries(&id).await?;
            let preview = first_user_preview(&messages.iter().map(|s| s.message.clone()).collect::<Vec<_>>());

            entries.push(SessionListEntry {
                id: manifest.id,
                created_at: manifest.created_at,
                updated_at: manifest.updated_at,
                metadata: manifest.metadata,
                message_count: messages.len(),
                system_message_count: system_messages.len(),
                summary_count: summaries.len(),
                compression_count: manifest.compression_count,
                preview,
            });
        }
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, MemoryError> {
        let dir = self.session_dir(session_id);
        let result = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(session_id, "deleted session");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        self.remove_from_index(session_id).await?;
        result
    }

    async fn find_latest_session(&self) -> Result<Option<String>, MemoryError> {
        Ok(self.list_sessions(1, 0).await?.into_iter().next().map(|e| e.id))
    }

    /// Returns `Some` only when exactly one session id starts with `prefix`;
    /// an ambiguous prefix (or no match) returns `None`.
    async fn find_session_by_prefix(&self, prefix: &str) -> Result<Option<String>, MemoryError> {
        let ids = self.list_session_dirs().await?;
        let mut matches = ids.into_iter().filter(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    async fn get_session_stats(&self, session_id: &str) -> Result<Option<SessionStats>, MemoryError> {
        let Some(loaded) = self.load_session(session_id).await? else {
            return Ok(None);
        };
        let total_original_tokens: u64 = loaded.summaries.iter().map(|s| s.original_tokens).sum();
        let total_compressed_tokens: u64 = loaded.summaries.iter().map(|s| s.compressed_tokens).sum();
        Ok(Some(SessionStats {
            message_count: loaded.messages.len(),
            system_message_count: loaded.system_messages.len(),
            summary_count: loaded.summaries.len(),
            compression_count: loaded.summaries.len() as u32,
            current_tokens: 0,
            total_original_tokens,
            total_compressed_tokens,
            token_savings: total_original_tokens as i64 - total_compressed_tokens as i64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> FileSessionStore {
        FileSessionStore::new(dir.path().join("sessions"))
    }

    #[tokio::test]
    async fn create_session_returns_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        assert_eq!(id.len(), 36);
    }

    #[tokio::test]
    async fn create_session_writes_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        let manifest_path = dir.path().join("sessions").join(&id).join(MANIFEST_FILE);
        assert!(manifest_path.exists());
    }

    #[tokio::test]
    async fn loads_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert!(loaded.messages.is_empty());
        assert!(loaded.system_messages.is_empty());
        assert!(loaded.config.is_none());
    }

    #[tokio::test]
    async fn saves_and_loads_a_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        store.save_message(&id, &Message::user("Hello"), 5).await.unwrap();

        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.messages[0].extract_text(), "Hello");
    }

    #[tokio::test]
    async fn system_messages_saved_separately() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        store.save_message(&id, &Message::system("be helpful"), 0).await.unwrap();

        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.system_messages.len(), 1);
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn tool_call_round_trip_preserves_linkage() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();

        store.save_message(&id, &Message::assistant_tool_use("call_xyz789", "calculator", serde_json::Map::new()), 15).await.unwrap();
        store.save_message(&id, &Message::tool_result("call_xyz789", "calculator", "4"), 5).await.unwrap();

        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].tool_uses()[0].id, loaded.messages[1].tool_call_id.as_deref().unwrap());
    }

    #[tokio::test]
    async fn save_memory_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();

        store.save_memory(&id, &[Message::system("First")], &[Message::user("Message 1")]).await.unwrap();
        store.save_memory(&id, &[Message::system("Second")], &[Message::user("Message 2")]).await.unwrap();

        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.system_messages.len(), 1);
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.system_messages[0].extract_text(), "Second");
        assert_eq!(loaded.messages[0].extract_text(), "Message 2");
    }

    #[tokio::test]
    async fn lists_sessions_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for _ in 0..10 {
            store.create_session(None, None).await.unwrap();
        }
        let sessions = store.list_sessions(5, 0).await.unwrap();
        assert_eq!(sessions.len(), 5);
    }

    #[tokio::test]
    async fn list_includes_preview() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        store.save_message(&id, &Message::user("What is 2+2?"), 5).await.unwrap();

        let sessions = store.list_sessions(10, 0).await.unwrap();
        assert_eq!(sessions[0].preview.as_deref(), Some("What is 2+2?"));
    }

    #[tokio::test]
    async fn load_nonexistent_session_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.load_session("nonexistent-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_session_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        store.save_message(&id, &Message::user("Hello"), 5).await.unwrap();

        assert!(store.delete_session(&id).await.unwrap());
        assert!(store.load_session(&id).await.unwrap().is_none());
        assert!(!store.delete_session(&id).await.unwrap());
    }

    #[tokio::test]
    async fn finds_latest_session_by_update_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create_session(None, None).await.unwrap();
        let second = store.create_session(None, None).await.unwrap();
        store.save_message(&second, &Message::user("Latest"), 5).await.unwrap();

        assert_eq!(store.find_latest_session().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn finds_session_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        let prefix = &id[..8];
        assert_eq!(store.find_session_by_prefix(prefix).await.unwrap(), Some(id));
        assert_eq!(store.find_session_by_prefix("zzzzz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_session_by_prefix_returns_none_when_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.create_session(None, None).await.unwrap();
        store.create_session(None, None).await.unwrap();
        // Every UUID v4 shares the empty prefix, so this is always ambiguous.
        assert_eq!(store.find_session_by_prefix("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn index_file_written_at_sessions_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        let index_path = dir.path().join("sessions").join(INDEX_FILE);
        assert!(index_path.exists());
        let contents = tokio::fs::read_to_string(&index_path).await.unwrap();
        assert!(contents.contains(&id));
    }

    #[tokio::test]
    async fn index_drops_entry_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        store.delete_session(&id).await.unwrap();
        let index = store.read_index().await.unwrap();
        assert!(!index.sessions.contains_key(&id));
    }

    #[tokio::test]
    async fn update_session_metadata_overwrites_and_bumps_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        let mut metadata = Map::new();
        metadata.insert("label".into(), json!("renamed"));

        assert!(store.update_session_metadata(&id, metadata).await.unwrap());
        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.metadata.get("label"), Some(&json!("renamed")));

        assert!(!store.update_session_metadata("does-not-exist", Map::new()).await.unwrap());
    }

    #[tokio::test]
    async fn session_stats_reports_message_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = store.create_session(None, None).await.unwrap();
        store.save_memory(&id, &[], &[Message::user("Hello"), Message::assistant("Hi")]).await.unwrap();

        let stats = store.get_session_stats(&id).await.unwrap().unwrap();
        assert_eq!(stats.message_count, 2);
    }

    #[tokio::test]
    async fn create_session_persists_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut metadata = Map::new();
        metadata.insert("index".into(), json!(3));
        let id = store.create_session(Some(metadata), None).await.unwrap();

        let loaded = store.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.metadata.get("index"), Some(&json!(3)));
    }
}
