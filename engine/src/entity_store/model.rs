//! Core data model: [`Entity`], [`Event`], [`Relationship`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `{target_id, type, metadata}` edge out of an entity. `type` is free-form;
/// `metadata` carries flags such as `resolved`, `created_in_era`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub target_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Relationship {
    pub fn is_resolved(&self) -> bool {
        self.metadata
            .get("resolved")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The universal record. Every piece of project data is an entity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub era_id: Option<String>,
    pub parent_version_id: Option<String>,
    pub model_preference: Option<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// A `yaml_path`-sized slug used as the on-disk file name, not a full path.
    pub fn slug(&self) -> String {
        slug::slugify(&self.name)
    }
}

/// One mutation of the audit record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(EventType::Create),
            "UPDATE" => Some(EventType::Update),
            "DELETE" => Some(EventType::Delete),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub parent_event_id: Option<String>,
    pub branch_id: String,
    pub sequence: i64,
    pub event_type: EventType,
    pub container_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}
