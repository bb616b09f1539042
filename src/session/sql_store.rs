use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::compressor::Summary;
use crate::config::MemoryConfig;
use crate::error::MemoryError;
use crate::types::{Message, Role};

use super::{first_user_preview, LoadedSession, SessionListEntry, SessionStats, SessionStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    metadata TEXT,
    config TEXT,
    current_tokens INTEGER DEFAULT 0,
    compression_count INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens INTEGER DEFAULT 0,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp);

CREATE TABLE IF NOT EXISTS system_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    summary TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id, created_at);
";

fn to_sql_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn from_sql_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
                .unwrap_or_else(|_| Utc::now())
        })
}

/// SQLite-backed `SessionStore`, schema and table layout grounded directly
/// in the original `MemoryStore` (`sessions`/`messages`/`system_messages`/
/// `summaries`, FK cascade, `(session_id, timestamp)` index). A whole
/// `Summary` is stored as one JSON blob per row rather than split into
/// columns — the original split `preserved_messages` out as its own column,
/// but `Summary` here carries several more fields the original didn't track
/// (`ratio`, structured `metadata`), so a single serialized column avoids a
/// schema migration every time that type grows.
pub struct SqlSessionStore {
    conn: Mutex<Connection>,
}

impl SqlSessionStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %db_path.display(), "sql session store initialized");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_stored_message(row: &Row<'_>, role_override: Option<Role>) -> rusqlite::Result<(Message, DateTime<Utc>)> {
        let content: String = row.get("content")?;
        let message: Message = serde_json::from_str(&content).map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
        let message = if let Some(role) = role_override {
            debug_assert_eq!(message.role, role);
            message
        } else {
            message
        };
        let timestamp: String = row.get("timestamp")?;
        Ok((message, from_sql_time(&timestamp)))
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn create_session(&self, metadata: Option<Map<String, Value>>, config: Option<&MemoryConfig>) -> Result<String, MemoryError> {
        let session_id = Uuid::new_v4().to_string();
        let now = to_sql_time(Utc::now());
        let metadata_json = metadata.map(|m| serde_json::to_string(&m)).transpose()?;
        let config_json = config.map(serde_json::to_string).transpose()?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, created_at, updated_at, metadata, config) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, now, now, metadata_json, config_json],
        )?;
        Ok(session_id)
    }

    async fn save_message(&self, session_id: &str, message: &Message, tokens: u64) -> Result<(), MemoryError> {
        let content = serde_json::to_string(message)?;
        let now = to_sql_time(Utc::now());
        let conn = self.conn.lock().unwrap();

        if message.role == Role::System {
            conn.execute(
                "INSERT INTO system_messages (session_id, content, timestamp) VALUES (?1, ?2, ?3)",
                params![session_id, content, now],
            )?;
        } else {
            conn.execute(
                "INSERT INTO messages (session_id, role, content, tokens, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, format!("{:?}", message.role).to_lowercase(), content, tokens as i64, now],
            )?;
        }
        conn.execute("UPDATE sessions SET updated_at = ?1 WHERE id = ?2", params![now, session_id])?;
        Ok(())
    }

    async fn save_memory(&self, session_id: &str, system_messages: &[Message], messages: &[Message]) -> Result<(), MemoryError> {
        let now = to_sql_time(Utc::now());
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM system_messages WHERE session_id = ?1", params![session_id])?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;

        for msg in system_messages {
            let content = serde_json::to_string(msg)?;
            tx.execute(
                "INSERT INTO system_messages (session_id, content, timestamp) VALUES (?1, ?2, ?3)",
                params![session_id, content, now],
            )?;
        }
        for msg in messages {
            let content = serde_json::to_string(msg)?;
            tx.execute(
                "INSERT INTO messages (session_id, role, content, tokens, timestamp) VALUES (?1, ?2, ?3, 0, ?4)",
                params![session_id, format!("{:?}", msg.role).to_lowercase(), content, now],
            )?;
        }
        tx.execute("UPDATE sessions SET updated_at = ?1 WHERE id = ?2", params![now, session_id])?;
        tx.commit()?;
        Ok(())
    }

    async fn save_summary(&self, session_id: &str, summary: &Summary) -> Result<(), MemoryError> {
        let payload = serde_json::to_string(summary)?;
        let now = to_sql_time(Utc::now());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO summaries (session_id, summary, created_at) VALUES (?1, ?2, ?3)",
            params![session_id, payload, now],
        )?;
        conn.execute(
            "UPDATE sessions SET compression_count = compression_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        Ok(())
    }

    async fn update_session_metadata(&self, session_id: &str, metadata: Map<String, Value>) -> Result<bool, MemoryError> {
        let metadata_json = serde_json::to_string(&metadata)?;
        let now = to_sql_time(Utc::now());
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE sessions SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![metadata_json, now, session_id],
        )?;
        Ok(affected > 0)
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<LoadedSession>, MemoryError> {
        let conn = self.conn.lock().unwrap();

        let session_row: Option<(String, String, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT created_at, updated_at, metadata, config FROM sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((created_at, updated_at, metadata_json, config_json)) = session_row else {
            return Ok(None);
        };

        let metadata: Map<String, Value> = metadata_json.map(|j| serde_json::from_str(&j)).transpose()?.unwrap_or_default();
        let config: Option<MemoryConfig> = config_json.map(|j| serde_json::from_str(&j)).transpose()?;

        let mut stmt = conn.prepare("SELECT content, timestamp FROM system_messages WHERE session_id = ?1 ORDER BY timestamp")?;
        let system_messages = stmt
            .query_map(params![session_id], |row| Self::row_to_stored_message(row, Some(Role::System)))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(m, _)| m)
            .collect();

        let mut stmt = conn.prepare("SELECT content, timestamp FROM messages WHERE session_id = ?1 ORDER BY timestamp")?;
        let messages = stmt
            .query_map(params![session_id], |row| Self::row_to_stored_message(row, None))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(m, _)| m)
            .collect();

        let mut stmt = conn.prepare("SELECT summary FROM summaries WHERE session_id = ?1 ORDER BY created_at")?;
        let summaries = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|json| serde_json::from_str::<Summary>(&json))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(LoadedSession {
            metadata,
            config,
            system_messages,
            messages,
            summaries,
            created_at: from_sql_time(&created_at),
            updated_at: from_sql_time(&updated_at),
        }))
    }

    async fn list_sessions(&self, limit: usize, offset: usize) -> Result<Vec<SessionListEntry>, MemoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT
                s.id, s.created_at, s.updated_at, s.metadata, s.compression_count,
                COUNT(DISTINCT m.id) as message_count,
                COUNT(DISTINCT sm.id) as system_message_count,
                COUNT(DISTINCT su.id) as summary_count
            FROM sessions s
            LEFT JOIN messages m ON s.id = m.session_id
            LEFT JOIN system_messages sm ON s.id = sm.session_id
            LEFT JOIN summaries su ON s.id = su.session_id
            GROUP BY s.id
            ORDER BY s.updated_at DESC
            LIMIT ?1 OFFSET ?2",
        )?;

        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, created_at, updated_at, metadata_json, compression_count, message_count, system_message_count, summary_count) = row?;
            let (message_count, system_message_count, summary_count) = (message_count as usize, system_message_count as usize, summary_count as usize);
            let metadata: Map<String, Value> = metadata_json.map(|j| serde_json::from_str(&j)).transpose()?.unwrap_or_default();

            let mut preview_stmt = conn.prepare("SELECT content FROM messages WHERE session_id = ?1 AND role = 'user' ORDER BY timestamp LIMIT 1")?;
            let preview_content: Option<String> = preview_stmt.query_row(params![id], |row| row.get(0)).optional()?;
            let preview = preview_content
                .map(|c| serde_json::from_str::<Message>(&c))
                .transpose()?
                .and_then(|m| first_user_preview(std::slice::from_ref(&m)));

            entries.push(SessionListEntry {
                id,
                created_at: from_sql_time(&created_at),
                updated_at: from_sql_time(&updated_at),
                metadata,
                message_count,
                system_message_count,
                summary_count,
                compression_count,
                preview,
            });
        }
        Ok(entries)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, MemoryError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(affected > 0)
    }

    async fn find_latest_session(&self) -> Result<Option<String>, MemoryError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<String> = conn
            .query_row("SELECT id FROM sessions ORDER BY updated_at DESC LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    /// Returns `Some` only when exactly one session id starts with `prefix`;
    /// an ambiguous prefix (or no match) returns `None`.
    async fn find_session_by_prefix(&self, prefix: &str) -> Result<Option<String>, MemoryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM sessions WHERE id LIKE ?1 || '%'")?;
        let mut matches = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if matches.len() == 1 {
            Ok(Some(matches.remove(0)))
        } else {
            Ok(None)
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
