//! Error taxonomy for the entity store: validation, conflict,
//! not-found, and storage errors each propagate differently to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntityStoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: content hash mismatch for entity {entity_id}")]
    Conflict { entity_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for EntityStoreError {
    fn from(e: std::io::Error) -> Self {
        EntityStoreError::Storage(e.to_string())
    }
}

impl From<rusqlite::Error> for EntityStoreError {
    fn from(e: rusqlite::Error) -> Self {
        EntityStoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EntityStoreError {
    fn from(e: serde_json::Error) -> Self {
        EntityStoreError::Storage(e.to_string())
    }
}

impl From<serde_yaml::Error> for EntityStoreError {
    fn from(e: serde_yaml::Error) -> Self {
        EntityStoreError::Storage(e.to_string())
    }
}
