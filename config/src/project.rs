//! Project-wide settings: the lowest-priority level of the
//! Model Config Registry's four-level cascade (`default_model`), the
//! per-agent override table consulted at the "agent default" level, and the
//! shared `data_dir` / `context_budget` defaults the entity store and context
//! assembler are constructed with at startup.
//!
//! Reuses the same `$XDG_CONFIG_HOME/<app>/config.toml` file as the rest of
//! this crate's XDG layering, adding a `[project]` table alongside the
//! existing `[env]` one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::LoadError;

fn default_context_budget() -> usize {
    8_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    /// Project-wide fallback model id. An
    /// empty string means "no project default configured", the cascade
    /// caller must then fall back to a hard-coded engine default.
    #[serde(default)]
    pub default_model: String,

    /// Per-agent override table (cascade level 3, "agent default"). Falls
    /// back to a compiled-in per-agent default table when an agent has no
    /// entry here.
    #[serde(default)]
    pub agent_defaults: HashMap<String, String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            default_model: String::new(),
            agent_defaults: HashMap::new(),
            data_dir: default_data_dir(),
            context_budget: default_context_budget(),
        }
    }
}

#[derive(Default, Deserialize, Serialize)]
struct ConfigFile {
    #[serde(default)]
    project: ProjectConfig,
}

fn xdg_config_path(app_name: &str) -> Result<PathBuf, LoadError> {
    let base = cross_xdg::BaseDirs::new().map_err(|e| LoadError::XdgPath(e.to_string()))?;
    Ok(base.config_home().join(app_name).join("config.toml"))
}

/// Loads `[project]` from `$XDG_CONFIG_HOME/<app>/config.toml`. Returns
/// defaults when the file or the `[project]` table is absent.
pub fn load_project_config(app_name: &str) -> Result<ProjectConfig, LoadError> {
    let path = xdg_config_path(app_name)?;
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
    let file: ConfigFile = toml::from_str(&content)?;
    Ok(file.project)
}

/// Writes `config` back to `$XDG_CONFIG_HOME/<app>/config.toml`, preserving
/// any other top-level tables already in the file (notably `[env]`). Backs
/// `ModelConfigRegistry::update_config`.
pub fn save_project_config(app_name: &str, config: &ProjectConfig) -> Result<(), LoadError> {
    let path = xdg_config_path(app_name)?;
    let mut doc: toml::Value = if path.exists() {
        let content = std::fs::read_to_string(&path).map_err(LoadError::XdgRead)?;
        toml::from_str(&content)?
    } else {
        toml::Value::Table(toml::map::Map::new())
    };
    let project_value = toml::Value::try_from(config)
        .map_err(|e| LoadError::XdgPath(format!("serialize project config: {e}")))?;
    if let Some(table) = doc.as_table_mut() {
        table.insert("project".to_string(), project_value);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(LoadError::DotenvRead)?;
    }
    let rendered = toml::to_string_pretty(&doc)
        .map_err(|e| LoadError::XdgPath(format!("render project config: {e}")))?;
    std::fs::write(&path, rendered).map_err(LoadError::XdgRead)?;
    Ok(())
}

/// Like [`load_project_config`] but reads from an explicit path, used in
/// tests and by callers that keep project config outside the XDG tree.
pub fn load_project_config_from(path: impl AsRef<Path>) -> Result<ProjectConfig, LoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = std::fs::read_to_string(path).map_err(LoadError::XdgRead)?;
    let file: ConfigFile = toml::from_str(&content)?;
    Ok(file.project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_returns_defaults() {
        let cfg = load_project_config_from("/nonexistent/path/config.toml").unwrap();
        assert_eq!(cfg, ProjectConfig::default());
    }

    #[test]
    fn round_trips_project_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[project]
default_model = "openai/gpt-4o-mini"
context_budget = 12000

[project.agent_defaults]
research = "openai/gpt-4o"
"#,
        )
        .unwrap();

        let cfg = load_project_config_from(&path).unwrap();
        assert_eq!(cfg.default_model, "openai/gpt-4o-mini");
        assert_eq!(cfg.context_budget, 12000);
        assert_eq!(cfg.agent_defaults.get("research").unwrap(), "openai/gpt-4o");
    }
}
