//! Content Store (C1): durable append-only event log with
//! per-branch projection.
//!
//! Reads never fail on a missing branch, they return empty. Writes fail only
//! on storage error, which aborts the surrounding Unit of Work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;

use super::db::{ensure_schema, open_connection};
use super::error::EntityStoreError;
use super::model::{Event, EventType};
use crate::ids;

pub struct EventLog {
    db_path: PathBuf,
}

impl EventLog {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, EntityStoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = open_connection(&db_path)?;
        ensure_schema(&conn)?;
        Ok(Self { db_path })
    }

    fn next_sequence(conn: &Connection, branch_id: &str) -> Result<i64, EntityStoreError> {
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM event_log WHERE branch_id = ?1",
            params![branch_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(-1) + 1)
    }

    /// Appends one event atomically on its own connection; for use outside a
    /// Unit of Work commit (tests, ad-hoc tooling). The commit path appends
    /// events within its own transaction instead, see [`append_event_tx`].
    pub async fn append_event(
        &self,
        parent_event_id: Option<String>,
        branch_id: String,
        event_type: EventType,
        container_id: String,
        payload: Value,
    ) -> Result<String, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction()?;
            let event_id = append_event_tx(
                &tx,
                parent_event_id,
                &branch_id,
                event_type,
                &container_id,
                &payload,
            )?;
            tx.commit()?;
            Ok(event_id)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_event_chain(&self, branch_id: String) -> Result<Vec<Event>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            get_event_chain_conn(&conn, &branch_id)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    /// Creates `new_branch_id` by duplicating every event of `source_branch_id`
    /// up to and including `fork_event_id`, so the new branch's projection
    /// equals the source's projection at that point, and later appends to
    /// either branch do not affect the other.
    pub async fn branch(
        &self,
        source_branch_id: String,
        new_branch_id: String,
        fork_event_id: String,
    ) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            let tx = conn.transaction()?;
            let chain = get_event_chain_conn(&tx, &source_branch_id)?;
            let fork_index = chain
                .iter()
                .position(|e| e.event_id == fork_event_id)
                .ok_or_else(|| {
                    EntityStoreError::NotFound(format!(
                        "fork event {fork_event_id} not found on branch {source_branch_id}"
                    ))
                })?;
            for event in &chain[..=fork_index] {
                tx.execute(
                    "INSERT INTO event_log (event_id, parent_event_id, branch_id, sequence, event_type, container_id, payload_json, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        ids::new_id(),
                        event.event_id,
                        new_branch_id,
                        event.sequence,
                        event.event_type.as_str(),
                        event.container_id,
                        serde_json::to_string(&event.payload)?,
                        event.timestamp.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn project_state(
        &self,
        branch_id: String,
    ) -> Result<HashMap<String, Value>, EntityStoreError> {
        let chain = self.get_event_chain(branch_id).await?;
        Ok(project_chain(&chain))
    }
}

/// Replays a chain of events (already in insertion order) into current state:
/// CREATE/UPDATE overwrite, DELETE removes. Used both by [`EventLog::project_state`]
/// and anywhere an in-memory chain needs projecting without a round-trip to disk.
pub fn project_chain(chain: &[Event]) -> HashMap<String, Value> {
    let mut state = HashMap::new();
    for event in chain {
        match event.event_type {
            EventType::Create | EventType::Update => {
                state.insert(event.container_id.clone(), event.payload.clone());
            }
            EventType::Delete => {
                state.remove(&event.container_id);
            }
        }
    }
    state
}

fn get_event_chain_conn(conn: &Connection, branch_id: &str) -> Result<Vec<Event>, EntityStoreError> {
    let mut stmt = conn.prepare(
        "SELECT event_id, parent_event_id, branch_id, sequence, event_type, container_id, payload_json, timestamp
         FROM event_log WHERE branch_id = ?1 ORDER BY sequence ASC",
    )?;
    let rows = stmt.query_map(params![branch_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (event_id, parent_event_id, branch_id, sequence, event_type, container_id, payload_json, timestamp) =
            row?;
        events.push(Event {
            event_id,
            parent_event_id,
            branch_id,
            sequence,
            event_type: EventType::parse(&event_type).ok_or_else(|| {
                EntityStoreError::Storage(format!("unknown event_type {event_type}"))
            })?,
            container_id,
            payload: serde_json::from_str(&payload_json)?,
            timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| EntityStoreError::Storage(e.to_string()))?,
        });
    }
    Ok(events)
}

/// Appends one event within an already-open transaction, the path used by
/// the Unit of Work commit sequence.
pub fn append_event_tx(
    tx: &rusqlite::Transaction<'_>,
    parent_event_id: Option<String>,
    branch_id: &str,
    event_type: EventType,
    container_id: &str,
    payload: &Value,
) -> Result<String, EntityStoreError> {
    let event_id = ids::new_id();
    let sequence = EventLog::next_sequence(tx, branch_id)?;
    tx.execute(
        "INSERT INTO event_log (event_id, parent_event_id, branch_id, sequence, event_type, container_id, payload_json, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event_id,
            parent_event_id,
            branch_id,
            sequence,
            event_type.as_str(),
            container_id,
            serde_json::to_string(payload)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(event_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_log() -> (EventLog, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.db")).unwrap();
        (log, dir)
    }

    #[tokio::test]
    async fn append_and_chain_preserve_insertion_order() {
        let (log, _dir) = temp_log().await;
        log.append_event(None, "main".into(), EventType::Create, "e1".into(), json!({"name": "a"}))
            .await
            .unwrap();
        log.append_event(None, "main".into(), EventType::Update, "e1".into(), json!({"name": "b"}))
            .await
            .unwrap();
        let chain = log.get_event_chain("main".into()).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].sequence, 0);
        assert_eq!(chain[1].sequence, 1);
    }

    #[tokio::test]
    async fn project_state_applies_create_update_delete() {
        let (log, _dir) = temp_log().await;
        log.append_event(None, "main".into(), EventType::Create, "e1".into(), json!({"v": 1}))
            .await
            .unwrap();
        log.append_event(None, "main".into(), EventType::Update, "e1".into(), json!({"v": 2}))
            .await
            .unwrap();
        let state = log.project_state("main".into()).await.unwrap();
        assert_eq!(state.get("e1"), Some(&json!({"v": 2})));

        log.append_event(None, "main".into(), EventType::Delete, "e1".into(), json!(null))
            .await
            .unwrap();
        let state = log.project_state("main".into()).await.unwrap();
        assert!(!state.contains_key("e1"));
    }

    #[tokio::test]
    async fn missing_branch_projects_empty_without_error() {
        let (log, _dir) = temp_log().await;
        let state = log.project_state("does-not-exist".into()).await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn branch_copies_projection_up_to_fork_point_only() {
        let (log, _dir) = temp_log().await;
        log.append_event(None, "main".into(), EventType::Create, "e1".into(), json!({"v": 1}))
            .await
            .unwrap();
        let fork_id = log
            .append_event(None, "main".into(), EventType::Update, "e1".into(), json!({"v": 2}))
            .await
            .unwrap();
        log.append_event(None, "main".into(), EventType::Update, "e1".into(), json!({"v": 3}))
            .await
            .unwrap();

        log.branch("main".into(), "alt".into(), fork_id).await.unwrap();
        let alt_state = log.project_state("alt".into()).await.unwrap();
        assert_eq!(alt_state.get("e1"), Some(&json!({"v": 2})));

        log.append_event(None, "alt".into(), EventType::Update, "e1".into(), json!({"v": 99}))
            .await
            .unwrap();
        let main_state = log.project_state("main".into()).await.unwrap();
        assert_eq!(main_state.get("e1"), Some(&json!({"v": 3})));
    }
}
