//! Session & Message Store
//!
//! SQLite persistence for agent sessions, their ordered messages, and
//! per-session memory entries. Sessions own their messages and
//! memories: deleting a session cascades both. Messages are totally
//! ordered by (created_at, insertion sequence).

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Message roles stored in a session transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// A persisted session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: i64,
    pub is_active: bool,
    pub is_archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
}

/// Fields for creating a session; defaults are resolved by the caller
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub title: Option<String>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: i64,
}

/// Partial session update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub is_active: Option<bool>,
    pub is_archived: Option<bool>,
}

/// A persisted message
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: i64,
    pub event_type: Option<String>,
    pub skill_name: Option<String>,
    pub extra: Option<serde_json::Value>,
}

/// Fields for appending a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub event_type: Option<String>,
    pub skill_name: Option<String>,
    pub extra: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            event_type: None,
            skill_name: None,
            extra: None,
        }
    }

    pub fn with_skill(mut self, skill_name: impl Into<String>) -> Self {
        self.skill_name = Some(skill_name.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// A persisted memory entry, scoped to one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub category: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("message `{0}` not found")]
    MessageNotFound(String),

    #[error("memory `{0}` not found")]
    MemoryNotFound(String),
}

/// SQLite-backed session store. A single connection behind a mutex
/// serializes concurrent writers; reads go through the same lock and
/// stay short.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Session store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT,
                model TEXT NOT NULL,
                system_prompt TEXT,
                temperature REAL NOT NULL,
                max_tokens INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_archived INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL CHECK(role IN ('system', 'user', 'assistant', 'tool')),
                content TEXT NOT NULL,
                event_type TEXT,
                skill_name TEXT,
                extra TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session
                ON messages(session_id, created_at, seq);

            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'fact',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER,
                UNIQUE(session_id, key)
            );
            "#,
        )?;
        Ok(())
    }

    // ==================== Sessions ====================

    pub fn create_session(&self, data: CreateSession) -> Result<Session, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO sessions (id, title, model, system_prompt, temperature, max_tokens, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                data.title,
                data.model,
                data.system_prompt,
                data.temperature,
                data.max_tokens,
                now
            ],
        )?;
        drop(conn);
        info!("Created session {}", id);
        self.get_session(&id)
    }

    pub fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT id, title, model, system_prompt, temperature, max_tokens,
                    is_active, is_archived, created_at, updated_at,
                    (SELECT COUNT(*) FROM messages WHERE session_id = sessions.id)
             FROM sessions WHERE id = ?1",
            params![id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Paged listing, most recently updated first
    pub fn list_sessions(
        &self,
        page: u32,
        page_size: u32,
        include_archived: bool,
    ) -> Result<(Vec<Session>, u64), StoreError> {
        let page = page.max(1);
        let conn = self.conn.lock().expect("store lock poisoned");

        let filter = if include_archived {
            ""
        } else {
            "WHERE is_archived = 0"
        };
        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sessions {}", filter),
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT id, title, model, system_prompt, temperature, max_tokens,
                    is_active, is_archived, created_at, updated_at,
                    (SELECT COUNT(*) FROM messages WHERE session_id = sessions.id)
             FROM sessions {}
             ORDER BY updated_at DESC
             LIMIT ?1 OFFSET ?2",
            filter
        ))?;
        let sessions = stmt
            .query_map(
                params![page_size, (page - 1) * page_size],
                row_to_session,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((sessions, total))
    }

    pub fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session, StoreError> {
        // Verify existence first so a no-op patch still 404s properly
        let current = self.get_session(id)?;

        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE sessions SET title = ?2, system_prompt = ?3, temperature = ?4,
                    max_tokens = ?5, is_active = ?6, is_archived = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                id,
                patch.title.or(current.title),
                patch.system_prompt.or(current.system_prompt),
                patch.temperature.unwrap_or(current.temperature),
                patch.max_tokens.unwrap_or(current.max_tokens),
                patch.is_active.unwrap_or(current.is_active),
                patch.is_archived.unwrap_or(current.is_archived),
                now_ms()
            ],
        )?;
        drop(conn);
        self.get_session(id)
    }

    /// Delete a session; messages and memories cascade
    pub fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let rows = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        info!("Deleted session {}", id);
        Ok(())
    }

    // ==================== Messages ====================

    pub fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        self.session_exists(session_id)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let extra = message
            .extra
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());

        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO messages (id, session_id, role, content, event_type, skill_name, extra, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                session_id,
                message.role.as_str(),
                message.content,
                message.event_type,
                message.skill_name,
                extra,
                now
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![session_id, now],
        )?;
        drop(conn);

        debug!("Appended {} message to session {}", message.role.as_str(), session_id);
        self.get_message(session_id, &id)
    }

    fn get_message(&self, session_id: &str, id: &str) -> Result<StoredMessage, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT id, session_id, role, content, event_type, skill_name, extra, created_at
             FROM messages WHERE session_id = ?1 AND id = ?2",
            params![session_id, id],
            row_to_message,
        )
        .optional()?
        .ok_or_else(|| StoreError::MessageNotFound(id.to_string()))
    }

    /// Messages in chronological order. With a limit, the most recent
    /// N are returned, still oldest-first.
    pub fn messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.session_exists(session_id)?;
        let conn = self.conn.lock().expect("store lock poisoned");

        let mut messages = match limit {
            Some(n) => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, role, content, event_type, skill_name, extra, created_at
                     FROM messages WHERE session_id = ?1
                     ORDER BY created_at DESC, seq DESC LIMIT ?2",
                )?;
                let mut rows = stmt
                    .query_map(params![session_id, n], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.reverse();
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, role, content, event_type, skill_name, extra, created_at
                     FROM messages WHERE session_id = ?1
                     ORDER BY created_at ASC, seq ASC",
                )?;
                let rows = stmt
                    .query_map(params![session_id], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        // Defensive: keep total order stable even if SQLite returned
        // equal timestamps out of seq order (it will not, but cheap).
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    /// Delete one message; with `include_following`, atomically remove
    /// the target and every later message of the same session.
    pub fn delete_message(
        &self,
        session_id: &str,
        message_id: &str,
        include_following: bool,
    ) -> Result<usize, StoreError> {
        self.session_exists(session_id)?;
        let conn = self.conn.lock().expect("store lock poisoned");

        let target: Option<(i64, i64)> = conn
            .query_row(
                "SELECT created_at, seq FROM messages WHERE session_id = ?1 AND id = ?2",
                params![session_id, message_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (created_at, seq) =
            target.ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;

        let deleted = if include_following {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1
                 AND (created_at > ?2 OR (created_at = ?2 AND seq >= ?3))",
                params![session_id, created_at, seq],
            )?
        } else {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1 AND id = ?2",
                params![session_id, message_id],
            )?
        };

        info!(
            "Deleted {} message(s) from session {} (following={})",
            deleted, session_id, include_following
        );
        Ok(deleted)
    }

    /// Remove all messages of a session
    pub fn clear_messages(&self, session_id: &str) -> Result<usize, StoreError> {
        self.session_exists(session_id)?;
        let conn = self.conn.lock().expect("store lock poisoned");
        let rows = conn.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(rows)
    }

    /// Number of user messages; the gate for memory retrieval counts
    /// user turns only.
    pub fn user_message_count(&self, session_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND role = 'user'",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    // ==================== Memories ====================

    pub fn set_memory(
        &self,
        session_id: &str,
        key: &str,
        value: serde_json::Value,
        category: &str,
        ttl_secs: Option<i64>,
    ) -> Result<MemoryEntry, StoreError> {
        self.session_exists(session_id)?;
        let now = now_ms();
        let expires_at = ttl_secs.map(|ttl| now + ttl * 1000);
        let serialized = serde_json::to_string(&value).unwrap_or_default();

        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO memories (id, session_id, key, value, category, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
             ON CONFLICT(session_id, key) DO UPDATE SET
                 value = excluded.value,
                 category = excluded.category,
                 updated_at = excluded.updated_at,
                 expires_at = excluded.expires_at",
            params![
                uuid::Uuid::new_v4().to_string(),
                session_id,
                key,
                serialized,
                category,
                now,
                expires_at
            ],
        )?;
        drop(conn);
        self.get_memory(session_id, key)
    }

    pub fn get_memory(&self, session_id: &str, key: &str) -> Result<MemoryEntry, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT key, value, category, created_at, updated_at, expires_at
             FROM memories WHERE session_id = ?1 AND key = ?2",
            params![session_id, key],
            row_to_memory,
        )
        .optional()?
        .ok_or_else(|| StoreError::MemoryNotFound(key.to_string()))
    }

    /// All non-expired memory entries of a session
    pub fn list_memories(&self, session_id: &str) -> Result<Vec<MemoryEntry>, StoreError> {
        self.session_exists(session_id)?;
        let now = now_ms();
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT key, value, category, created_at, updated_at, expires_at
             FROM memories WHERE session_id = ?1
             AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let memories = stmt
            .query_map(params![session_id, now], row_to_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    pub fn delete_memory(&self, session_id: &str, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let rows = conn.execute(
            "DELETE FROM memories WHERE session_id = ?1 AND key = ?2",
            params![session_id, key],
        )?;
        if rows == 0 {
            return Err(StoreError::MemoryNotFound(key.to_string()));
        }
        Ok(())
    }

    fn session_exists(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        model: row.get(2)?,
        system_prompt: row.get(3)?,
        temperature: row.get(4)?,
        max_tokens: row.get(5)?,
        is_active: row.get(6)?,
        is_archived: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        message_count: row.get(10)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    let extra: Option<String> = row.get(6)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::from_str(&role).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        event_type: row.get(4)?,
        skill_name: row.get(5)?,
        extra: extra.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(7)?,
    })
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let value: String = row.get(1)?;
    Ok(MemoryEntry {
        key: row.get(0)?,
        value: serde_json::from_str(&value)
            .unwrap_or(serde_json::Value::String(value)),
        category: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    fn new_session(store: &SessionStore) -> Session {
        store
            .create_session(CreateSession {
                title: None,
                model: "test-model".into(),
                system_prompt: None,
                temperature: 0.7,
                max_tokens: 4096,
            })
            .unwrap()
    }

    #[test]
    fn test_session_roundtrip() {
        let store = test_store();
        let session = new_session(&store);

        let fetched = store.get_session(&session.id).unwrap();
        assert_eq!(fetched.model, "test-model");
        assert!(fetched.is_active);
        assert!(!fetched.is_archived);

        store.delete_session(&session.id).unwrap();
        assert!(matches!(
            store.get_session(&session.id),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_update_session_partial() {
        let store = test_store();
        let session = new_session(&store);

        let updated = store
            .update_session(
                &session.id,
                SessionPatch {
                    title: Some("My chat".into()),
                    is_archived: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.title.as_deref(), Some("My chat"));
        assert!(updated.is_archived);
        // Untouched fields survive
        assert_eq!(updated.model, "test-model");
        assert_eq!(updated.max_tokens, 4096);
    }

    #[test]
    fn test_list_sessions_filters_archived() {
        let store = test_store();
        let a = new_session(&store);
        let b = new_session(&store);
        store
            .update_session(
                &b.id,
                SessionPatch {
                    is_archived: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let (visible, total) = store.list_sessions(1, 20, false).unwrap();
        assert_eq!(total, 1);
        assert_eq!(visible[0].id, a.id);

        let (all, total) = store.list_sessions(1, 20, true).unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_messages_chronological_and_complete() {
        let store = test_store();
        let session = new_session(&store);

        for i in 0..5 {
            store
                .append_message(
                    &session.id,
                    NewMessage::new(MessageRole::User, format!("msg {}", i)),
                )
                .unwrap();
        }

        let messages = store.messages(&session.id, None).unwrap();
        assert_eq!(messages.len(), 5);
        for (i, msg) in messages.iter().enumerate() {
            assert_eq!(msg.content, format!("msg {}", i));
        }
        for pair in messages.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn test_messages_limit_returns_most_recent() {
        let store = test_store();
        let session = new_session(&store);
        for i in 0..6 {
            store
                .append_message(
                    &session.id,
                    NewMessage::new(MessageRole::User, format!("msg {}", i)),
                )
                .unwrap();
        }

        let recent = store.messages(&session.id, Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "msg 4");
        assert_eq!(recent[1].content, "msg 5");
    }

    #[test]
    fn test_delete_message_with_following() {
        let store = test_store();
        let session = new_session(&store);
        let mut ids = Vec::new();
        for i in 0..6 {
            let msg = store
                .append_message(
                    &session.id,
                    NewMessage::new(MessageRole::User, format!("msg {}", i)),
                )
                .unwrap();
            ids.push(msg.id);
        }

        // Delete from index 2: the target plus everything later
        let deleted = store.delete_message(&session.id, &ids[2], true).unwrap();
        assert_eq!(deleted, 4);

        let remaining = store.messages(&session.id, None).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].content, "msg 0");
        assert_eq!(remaining[1].content, "msg 1");
    }

    #[test]
    fn test_delete_single_message() {
        let store = test_store();
        let session = new_session(&store);
        let first = store
            .append_message(&session.id, NewMessage::new(MessageRole::User, "a"))
            .unwrap();
        store
            .append_message(&session.id, NewMessage::new(MessageRole::Assistant, "b"))
            .unwrap();

        let deleted = store.delete_message(&session.id, &first.id, false).unwrap();
        assert_eq!(deleted, 1);
        let remaining = store.messages(&session.id, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "b");
    }

    #[test]
    fn test_clear_messages() {
        let store = test_store();
        let session = new_session(&store);
        store
            .append_message(&session.id, NewMessage::new(MessageRole::User, "a"))
            .unwrap();
        store
            .append_message(&session.id, NewMessage::new(MessageRole::Assistant, "b"))
            .unwrap();

        assert_eq!(store.clear_messages(&session.id).unwrap(), 2);
        assert!(store.messages(&session.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_user_message_count_ignores_other_roles() {
        let store = test_store();
        let session = new_session(&store);
        store
            .append_message(&session.id, NewMessage::new(MessageRole::User, "q1"))
            .unwrap();
        store
            .append_message(&session.id, NewMessage::new(MessageRole::Assistant, "a1"))
            .unwrap();
        store
            .append_message(
                &session.id,
                NewMessage::new(MessageRole::Tool, "result").with_skill("websearch_service"),
            )
            .unwrap();
        store
            .append_message(&session.id, NewMessage::new(MessageRole::User, "q2"))
            .unwrap();

        assert_eq!(store.user_message_count(&session.id).unwrap(), 2);
    }

    #[test]
    fn test_delete_session_cascades() {
        let store = test_store();
        let session = new_session(&store);
        store
            .append_message(&session.id, NewMessage::new(MessageRole::User, "hello"))
            .unwrap();
        store
            .set_memory(&session.id, "color", serde_json::json!("blue"), "preference", None)
            .unwrap();

        store.delete_session(&session.id).unwrap();
        assert!(matches!(
            store.messages(&session.id, None),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_memory_upsert_and_expiry() {
        let store = test_store();
        let session = new_session(&store);

        store
            .set_memory(&session.id, "name", serde_json::json!("Max"), "fact", None)
            .unwrap();
        store
            .set_memory(&session.id, "name", serde_json::json!("Maxine"), "fact", None)
            .unwrap();
        let entry = store.get_memory(&session.id, "name").unwrap();
        assert_eq!(entry.value, serde_json::json!("Maxine"));

        // Already-expired entry is filtered from listing
        store
            .set_memory(&session.id, "stale", serde_json::json!(1), "context", Some(-10))
            .unwrap();
        let listed = store.list_memories(&session.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "name");
    }

    #[test]
    fn test_memory_delete() {
        let store = test_store();
        let session = new_session(&store);
        store
            .set_memory(&session.id, "k", serde_json::json!("v"), "fact", None)
            .unwrap();
        store.delete_memory(&session.id, "k").unwrap();
        assert!(matches!(
            store.delete_memory(&session.id, "k"),
            Err(StoreError::MemoryNotFound(_))
        ));
    }

    #[test]
    fn test_message_extra_roundtrip() {
        let store = test_store();
        let session = new_session(&store);
        let extra = serde_json::json!({"stdout": "RESULT", "success": true});
        let msg = store
            .append_message(
                &session.id,
                NewMessage::new(MessageRole::Tool, "RESULT")
                    .with_skill("websearch_service")
                    .with_event_type("skill_result")
                    .with_extra(extra.clone()),
            )
            .unwrap();
        assert_eq!(msg.extra, Some(extra));
        assert_eq!(msg.skill_name.as_deref(), Some("websearch_service"));
    }

    #[test]
    fn test_append_to_missing_session_fails() {
        let store = test_store();
        assert!(matches!(
            store.append_message("nope", NewMessage::new(MessageRole::User, "x")),
            Err(StoreError::SessionNotFound(_))
        ));
    }
}
