//! YAML entity file persistence: one human-readable file per
//! entity under `<data_dir>/<entity_type>/<slug>.yaml`, reserved metadata
//! keys alongside the entity's attributes verbatim, attribute keys that
//! collide with a reserved name namespaced with a leading underscore and
//! stripped back out on read.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;
use serde_yaml::Mapping;
use sha2::{Digest, Sha256};

use super::error::EntityStoreError;
use super::model::{Entity, Relationship};

const RESERVED_KEYS: &[&str] = &[
    "id",
    "entity_type",
    "container_type",
    "name",
    "parent_id",
    "sort_order",
    "tags",
    "relationships",
    "era_id",
    "parent_version_id",
    "model_preference",
    "created_at",
    "updated_at",
];

/// SHA-256 of the canonically-serialised (key-sorted) attributes. Unrelated
/// to insertion order or formatting, so logically-identical attribute sets
/// always hash the same.
pub fn content_hash(attributes: &HashMap<String, Value>) -> String {
    let sorted: BTreeMap<&String, &Value> = attributes.iter().collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn render_yaml(entity: &Entity) -> Result<String, EntityStoreError> {
    let mut map = Mapping::new();
    for (key, value) in &entity.attributes {
        let out_key = if RESERVED_KEYS.contains(&key.as_str()) {
            format!("_{key}")
        } else {
            key.clone()
        };
        map.insert(
            serde_yaml::Value::String(out_key),
            serde_json_to_yaml(value.clone()),
        );
    }

    map.insert("id".into(), entity.id.clone().into());
    map.insert("entity_type".into(), entity.entity_type.clone().into());
    map.insert("container_type".into(), entity.entity_type.clone().into());
    map.insert("name".into(), entity.name.clone().into());
    map.insert(
        "parent_id".into(),
        entity
            .parent_id
            .clone()
            .map(serde_yaml::Value::String)
            .unwrap_or(serde_yaml::Value::Null),
    );
    map.insert("sort_order".into(), entity.sort_order.into());
    map.insert(
        "tags".into(),
        serde_yaml::Value::Sequence(entity.tags.iter().cloned().map(Into::into).collect()),
    );
    map.insert(
        "relationships".into(),
        serde_yaml::to_value(&entity.relationships).unwrap_or(serde_yaml::Value::Sequence(vec![])),
    );
    map.insert(
        "era_id".into(),
        entity
            .era_id
            .clone()
            .map(serde_yaml::Value::String)
            .unwrap_or(serde_yaml::Value::Null),
    );
    map.insert(
        "parent_version_id".into(),
        entity
            .parent_version_id
            .clone()
            .map(serde_yaml::Value::String)
            .unwrap_or(serde_yaml::Value::Null),
    );
    map.insert(
        "model_preference".into(),
        entity
            .model_preference
            .clone()
            .map(serde_yaml::Value::String)
            .unwrap_or(serde_yaml::Value::Null),
    );
    map.insert("created_at".into(), entity.created_at.to_rfc3339().into());
    map.insert("updated_at".into(), entity.updated_at.to_rfc3339().into());

    serde_yaml::to_string(&serde_yaml::Value::Mapping(map)).map_err(EntityStoreError::from)
}

pub fn parse_yaml(yaml: &str) -> Result<Entity, EntityStoreError> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let map = value
        .as_mapping()
        .ok_or_else(|| EntityStoreError::Validation("entity file is not a YAML mapping".into()))?;

    let mut attributes = HashMap::new();
    let mut id = None;
    let mut entity_type = None;
    let mut name = None;
    let mut parent_id = None;
    let mut sort_order = 0i64;
    let mut tags = Vec::new();
    let mut relationships = Vec::new();
    let mut era_id = None;
    let mut parent_version_id = None;
    let mut model_preference = None;
    let mut created_at = None;
    let mut updated_at = None;

    for (k, v) in map {
        let Some(key) = k.as_str() else { continue };
        match key {
            "id" => id = v.as_str().map(String::from),
            "entity_type" => entity_type = v.as_str().map(String::from),
            "container_type" => {
                if entity_type.is_none() {
                    entity_type = v.as_str().map(String::from);
                }
            }
            "name" => name = v.as_str().map(String::from),
            "parent_id" => parent_id = v.as_str().map(String::from),
            "sort_order" => sort_order = v.as_i64().unwrap_or(0),
            "tags" => {
                tags = v
                    .as_sequence()
                    .map(|seq| seq.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                    .unwrap_or_default();
            }
            "relationships" => {
                relationships = serde_yaml::from_value::<Vec<Relationship>>(v.clone()).unwrap_or_default();
            }
            "era_id" => era_id = v.as_str().map(String::from),
            "parent_version_id" => parent_version_id = v.as_str().map(String::from),
            "model_preference" => model_preference = v.as_str().map(String::from),
            "created_at" => created_at = v.as_str().and_then(parse_timestamp),
            "updated_at" => updated_at = v.as_str().and_then(parse_timestamp),
            other => {
                let attr_key = RESERVED_KEYS
                    .iter()
                    .find(|r| other == format!("_{r}"))
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| other.to_string());
                attributes.insert(attr_key, yaml_to_serde_json(v.clone()));
            }
        }
    }

    let now = Utc::now();
    Ok(Entity {
        id: id.ok_or_else(|| EntityStoreError::Validation("entity file missing id".into()))?,
        entity_type: entity_type
            .ok_or_else(|| EntityStoreError::Validation("entity file missing entity_type".into()))?,
        name: name.unwrap_or_default(),
        attributes,
        parent_id,
        sort_order,
        tags,
        relationships,
        era_id,
        parent_version_id,
        model_preference,
        content_hash: String::new(),
        created_at: created_at.unwrap_or(now),
        updated_at: updated_at.unwrap_or(now),
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn serde_json_to_yaml(value: Value) -> serde_yaml::Value {
    serde_yaml::to_value(value).unwrap_or(serde_yaml::Value::Null)
}

fn yaml_to_serde_json(value: serde_yaml::Value) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Entity {
        let now = Utc::now();
        Entity {
            id: "e1".into(),
            entity_type: "character".into(),
            name: "Aria Vance".into(),
            attributes: HashMap::from([
                ("backstory".to_string(), json!("An exiled court mage.")),
                ("tags".to_string(), json!(["protagonist"])),
            ]),
            parent_id: Some("chapter-1".into()),
            sort_order: 3,
            tags: vec!["pov".into()],
            relationships: vec![],
            era_id: None,
            parent_version_id: None,
            model_preference: Some("openai/gpt-4o-mini".into()),
            content_hash: "irrelevant-for-file".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn round_trips_through_yaml() {
        let entity = sample();
        let yaml = render_yaml(&entity).unwrap();
        let parsed = parse_yaml(&yaml).unwrap();
        assert_eq!(parsed.id, entity.id);
        assert_eq!(parsed.entity_type, entity.entity_type);
        assert_eq!(parsed.name, entity.name);
        assert_eq!(parsed.parent_id, entity.parent_id);
        assert_eq!(parsed.sort_order, entity.sort_order);
        assert_eq!(parsed.model_preference, entity.model_preference);
    }

    #[test]
    fn attribute_key_colliding_with_a_reserved_name_round_trips_unstripped() {
        let entity = sample();
        let yaml = render_yaml(&entity).unwrap();
        assert!(yaml.contains("_tags:"));
        let parsed = parse_yaml(&yaml).unwrap();
        assert_eq!(parsed.attributes.get("tags"), Some(&json!(["protagonist"])));
        assert_eq!(parsed.tags, vec!["pov".to_string()]);
    }

    #[test]
    fn content_hash_is_stable_under_key_reordering() {
        let mut a = HashMap::new();
        a.insert("z".to_string(), json!(1));
        a.insert("a".to_string(), json!(2));
        let mut b = HashMap::new();
        b.insert("a".to_string(), json!(2));
        b.insert("z".to_string(), json!(1));
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_changes_when_attributes_change() {
        let mut a = HashMap::new();
        a.insert("mood".to_string(), json!("tense"));
        let mut b = a.clone();
        b.insert("mood".to_string(), json!("calm"));
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
