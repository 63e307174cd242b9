//! Chat session/message persistence: its own SQLite
//! database, deliberately separate from the entity store's (the two stores
//! serve different read/write patterns, chat messages are append-mostly and
//! never sync to YAML). Built on the same `spawn_blocking` + `rusqlite`
//! idiom `entity_store::relational_index` already establishes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Compacted,
    Ended,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Compacted => "compacted",
            SessionState::Ended => "ended",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "compacted" => SessionState::Compacted,
            "ended" => SessionState::Ended,
            _ => SessionState::Active,
        }
    }
}

/// How much latitude the orchestrator has to act without asking first
///. Ordinal: higher values permit more unattended action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    Ask = 0,
    Suggest = 1,
    Execute = 2,
}

impl AutonomyLevel {
    fn from_i64(v: i64) -> Self {
        match v {
            2 => AutonomyLevel::Execute,
            1 => AutonomyLevel::Suggest,
            _ => AutonomyLevel::Ask,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            "system" => MessageRole::System,
            _ => MessageRole::User,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalState::Pending),
            "approved" => Some(ApprovalState::Approved),
            "rejected" => Some(ApprovalState::Rejected),
            _ => None,
        }
    }
}

/// One tool dispatch recorded against a message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionTrace {
    pub tool_name: String,
    pub context_summary: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub token_usage_in: u32,
    #[serde(default)]
    pub token_usage_out: u32,
    #[serde(default)]
    pub sub_invocations: Vec<Value>,
}

/// A saveable result surfaced alongside a message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_type: String,
    pub title: String,
    pub content: Value,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub is_saved: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub project_id: Option<String>,
    pub state: SessionState,
    pub autonomy_level: AutonomyLevel,
    pub context_budget: usize,
    pub token_usage: u64,
    pub digest: Option<String>,
    pub compaction_count: u32,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub action_traces: Vec<ActionTrace>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub mentioned_entity_ids: Vec<String>,
    pub approval_state: Option<ApprovalState>,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: crate::ids::new_id(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            action_traces: Vec::new(),
            artifacts: Vec::new(),
            mentioned_entity_ids: Vec::new(),
            approval_state: None,
            sort_order: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_mentioned_entity_ids(mut self, ids: Vec<String>) -> Self {
        self.mentioned_entity_ids = ids;
        self
    }

    pub fn with_action_traces(mut self, traces: Vec<ActionTrace>) -> Self {
        self.action_traces = traces;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

fn open_connection(path: impl AsRef<Path>) -> Result<Connection, ChatError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<(), ChatError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            project_id TEXT,
            state TEXT NOT NULL,
            autonomy_level INTEGER NOT NULL DEFAULT 0,
            context_budget INTEGER NOT NULL,
            token_usage INTEGER NOT NULL DEFAULT 0,
            digest TEXT,
            compaction_count INTEGER NOT NULL DEFAULT 0,
            tags_json TEXT NOT NULL DEFAULT '[]',
            schema_version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            action_traces_json TEXT NOT NULL DEFAULT '[]',
            artifacts_json TEXT NOT NULL DEFAULT '[]',
            mentioned_entity_ids_json TEXT NOT NULL DEFAULT '[]',
            approval_state TEXT,
            sort_order INTEGER NOT NULL,
            schema_version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            notes TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id);
        CREATE INDEX IF NOT EXISTS idx_chat_messages_session_sort ON chat_messages(session_id, sort_order);
        "#,
    )?;
    Ok(())
}

pub struct ChatSessionStore {
    db_path: PathBuf,
}

impl ChatSessionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = open_connection(&db_path)?;
        ensure_schema(&conn)?;
        Ok(Self { db_path })
    }

    pub async fn create_session(
        &self,
        name: String,
        project_id: Option<String>,
        autonomy_level: AutonomyLevel,
        context_budget: usize,
    ) -> Result<ChatSession, ChatError> {
        let now = Utc::now();
        let session = ChatSession {
            id: crate::ids::new_id(),
            name,
            project_id,
            state: SessionState::Active,
            autonomy_level,
            context_budget,
            token_usage: 0,
            digest: None,
            compaction_count: 0,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let db_path = self.db_path.clone();
        let to_insert = session.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            insert_session_tx(&conn, &to_insert)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))??;
        Ok(session)
    }

    pub async fn get_session(&self, id: String) -> Result<Option<ChatSession>, ChatError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(&format!("{SELECT_SESSION_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    pub async fn list_sessions(&self, project_id: Option<String>) -> Result<Vec<ChatSession>, ChatError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut sql = format!("{SELECT_SESSION_COLUMNS} WHERE 1=1");
            if project_id.is_some() {
                sql.push_str(" AND project_id = ?1");
            }
            sql.push_str(" ORDER BY updated_at DESC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = if let Some(p) = &project_id {
                stmt.query_map(params![p], row_to_session)?.collect::<Result<Vec<_>, _>>()?
            } else {
                stmt.query_map([], row_to_session)?.collect::<Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    pub async fn save_session(&self, session: ChatSession) -> Result<(), ChatError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            update_session_tx(&conn, &session)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    /// Deletes a session; `ON DELETE CASCADE` removes its messages
    ///.
    pub async fn delete_session(&self, id: String) -> Result<(), ChatError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    /// Appends `message`, assigning the next monotonic `sort_order` for its
    /// session.
    pub async fn append_message(&self, mut message: ChatMessage) -> Result<ChatMessage, ChatError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let next_sort_order: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM chat_messages WHERE session_id = ?1",
                params![message.session_id],
                |row| row.get(0),
            )?;
            message.sort_order = next_sort_order;
            insert_message_tx(&conn, &message)?;
            Ok(message)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    pub async fn get_messages(&self, session_id: String) -> Result<Vec<ChatMessage>, ChatError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(&format!(
                "{SELECT_MESSAGE_COLUMNS} WHERE session_id = ?1 ORDER BY sort_order ASC"
            ))?;
            let rows = stmt.query_map(params![session_id], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    /// The last `n` messages of a session, oldest-first (ready to feed
    /// straight into Layer 2 of the context manager).
    pub async fn get_recent_messages(&self, session_id: String, n: usize) -> Result<Vec<ChatMessage>, ChatError> {
        let mut all = self.get_messages(session_id).await?;
        if all.len() > n {
            all.drain(0..all.len() - n);
        }
        Ok(all)
    }
}

const SELECT_SESSION_COLUMNS: &str = "SELECT id, name, project_id, state, autonomy_level, context_budget, token_usage, digest, compaction_count, tags_json, created_at, updated_at FROM chat_sessions";
const SELECT_MESSAGE_COLUMNS: &str = "SELECT id, session_id, role, content, action_traces_json, artifacts_json, mentioned_entity_ids_json, approval_state, sort_order, created_at FROM chat_messages";

fn insert_session_tx(conn: &Connection, session: &ChatSession) -> Result<(), ChatError> {
    conn.execute(
        "INSERT INTO chat_sessions (id, name, project_id, state, autonomy_level, context_budget, token_usage, digest, compaction_count, tags_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            session.id,
            session.name,
            session.project_id,
            session.state.as_str(),
            session.autonomy_level as i64,
            session.context_budget as i64,
            session.token_usage as i64,
            session.digest,
            session.compaction_count,
            serde_json::to_string(&session.tags)?,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn update_session_tx(conn: &Connection, session: &ChatSession) -> Result<(), ChatError> {
    let updated = conn.execute(
        "UPDATE chat_sessions SET name = ?2, project_id = ?3, state = ?4, autonomy_level = ?5, context_budget = ?6, token_usage = ?7, digest = ?8, compaction_count = ?9, tags_json = ?10, updated_at = ?11 WHERE id = ?1",
        params![
            session.id,
            session.name,
            session.project_id,
            session.state.as_str(),
            session.autonomy_level as i64,
            session.context_budget as i64,
            session.token_usage as i64,
            session.digest,
            session.compaction_count,
            serde_json::to_string(&session.tags)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    if updated == 0 {
        return Err(ChatError::NotFound(format!("chat session {} not found", session.id)));
    }
    Ok(())
}

fn insert_message_tx(conn: &Connection, message: &ChatMessage) -> Result<(), ChatError> {
    conn.execute(
        "INSERT INTO chat_messages (id, session_id, role, content, action_traces_json, artifacts_json, mentioned_entity_ids_json, approval_state, sort_order, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            message.id,
            message.session_id,
            message.role.as_str(),
            message.content,
            serde_json::to_string(&message.action_traces)?,
            serde_json::to_string(&message.artifacts)?,
            serde_json::to_string(&message.mentioned_entity_ids)?,
            message.approval_state.map(|s| s.as_str()),
            message.sort_order,
            message.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<ChatSession> {
    let state: String = row.get(3)?;
    let tags_json: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    Ok(ChatSession {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        state: SessionState::parse(&state),
        autonomy_level: AutonomyLevel::from_i64(row.get(4)?),
        context_budget: row.get::<_, i64>(5)? as usize,
        token_usage: row.get::<_, i64>(6)? as u64,
        digest: row.get(7)?,
        compaction_count: row.get(8)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get(2)?;
    let action_traces_json: String = row.get(4)?;
    let artifacts_json: String = row.get(5)?;
    let mentioned_json: String = row.get(6)?;
    let approval_state: Option<String> = row.get(7)?;
    let created_at: String = row.get(9)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse(&role),
        content: row.get(3)?,
        action_traces: serde_json::from_str(&action_traces_json).unwrap_or_default(),
        artifacts: serde_json::from_str(&artifacts_json).unwrap_or_default(),
        mentioned_entity_ids: serde_json::from_str(&mentioned_json).unwrap_or_default(),
        approval_state: approval_state.and_then(|s| ApprovalState::parse(&s)),
        sort_order: row.get(8)?,
        created_at: parse_timestamp(&created_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ChatSessionStore {
        let dir = tempfile::tempdir().unwrap();
        ChatSessionStore::new(dir.path().join("chat.db")).unwrap()
    }

    #[tokio::test]
    async fn create_and_get_session_round_trips() {
        let store = store().await;
        let session = store
            .create_session("Chapter 3 draft".into(), Some("proj-1".into()), AutonomyLevel::Suggest, 4000)
            .await
            .unwrap();
        let fetched = store.get_session(session.id.clone()).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Chapter 3 draft");
        assert_eq!(fetched.autonomy_level, AutonomyLevel::Suggest);
        assert_eq!(fetched.state, SessionState::Active);
    }

    #[tokio::test]
    async fn messages_get_monotonic_sort_order() {
        let store = store().await;
        let session = store.create_session("s".into(), None, AutonomyLevel::Ask, 1000).await.unwrap();
        let m1 = store
            .append_message(ChatMessage::new(session.id.clone(), MessageRole::User, "hello"))
            .await
            .unwrap();
        let m2 = store
            .append_message(ChatMessage::new(session.id.clone(), MessageRole::Assistant, "hi there"))
            .await
            .unwrap();
        assert_eq!(m1.sort_order, 0);
        assert_eq!(m2.sort_order, 1);
        let messages = store.get_messages(session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn deleting_session_cascades_to_messages() {
        let store = store().await;
        let session = store.create_session("s".into(), None, AutonomyLevel::Ask, 1000).await.unwrap();
        store
            .append_message(ChatMessage::new(session.id.clone(), MessageRole::User, "hi"))
            .await
            .unwrap();
        store.delete_session(session.id.clone()).await.unwrap();
        let messages = store.get_messages(session.id).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn get_recent_messages_trims_to_the_tail() {
        let store = store().await;
        let session = store.create_session("s".into(), None, AutonomyLevel::Ask, 1000).await.unwrap();
        for i in 0..5 {
            store
                .append_message(ChatMessage::new(session.id.clone(), MessageRole::User, format!("msg {i}")))
                .await
                .unwrap();
        }
        let recent = store.get_recent_messages(session.id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "msg 3");
        assert_eq!(recent[1].content, "msg 4");
    }

    #[tokio::test]
    async fn save_session_rejects_unknown_id() {
        let store = store().await;
        let mut ghost = ChatSession {
            id: "nope".into(),
            name: "x".into(),
            project_id: None,
            state: SessionState::Active,
            autonomy_level: AutonomyLevel::Ask,
            context_budget: 100,
            token_usage: 0,
            digest: None,
            compaction_count: 0,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        ghost.name = "y".into();
        assert!(store.save_session(ghost).await.is_err());
    }
}
