//! Shared SQLite schema for the relational index, sync-metadata, relationships
//! and event log").
//! All four tables live in one database file so the Unit of Work (C4) can
//! upsert entities and append events inside a single transaction.

use std::path::Path;

use rusqlite::Connection;

use super::error::EntityStoreError;

pub fn open_connection(path: impl AsRef<Path>) -> Result<Connection, EntityStoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

pub fn ensure_schema(conn: &Connection) -> Result<(), EntityStoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            name TEXT NOT NULL,
            yaml_path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            attributes_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            container_type TEXT,
            parent_id TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            tags_json TEXT NOT NULL DEFAULT '[]',
            relationships_json TEXT NOT NULL DEFAULT '[]',
            era_id TEXT,
            parent_version_id TEXT,
            model_preference TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_entities_entity_type ON entities(entity_type);
        CREATE INDEX IF NOT EXISTS idx_entities_container_type ON entities(container_type);
        CREATE INDEX IF NOT EXISTS idx_entities_parent_id ON entities(parent_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_yaml_path ON entities(yaml_path);

        CREATE TABLE IF NOT EXISTS sync_metadata (
            yaml_path TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            mtime REAL NOT NULL,
            file_size INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            rel_type TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_relationships_source_type ON relationships(source_id, rel_type);

        CREATE TABLE IF NOT EXISTS event_log (
            event_id TEXT PRIMARY KEY,
            parent_event_id TEXT,
            branch_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            container_id TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_event_log_branch_sequence ON event_log(branch_id, sequence);
        "#,
    )?;
    Ok(())
}
