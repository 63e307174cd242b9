//! Skill definitions loaded from a directory at startup: each skill is a markdown file with a YAML frontmatter block
//! (`name`, `description`, `keywords`) followed by the system-prompt body,
//! parsed out instead of returning the raw file body.

use std::path::Path;

use serde::Deserialize;

use crate::error::AgentError;

#[derive(Clone, Debug, PartialEq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub keywords: Vec<String>,
}

#[derive(Deserialize)]
struct Frontmatter {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Splits a `---\n<yaml>\n---\n<body>` document. Files without a frontmatter
/// block are rejected, every skill needs at least a `name`.
fn split_frontmatter(raw: &str) -> Result<(&str, &str), AgentError> {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let rest = raw
        .strip_prefix("---\n")
        .ok_or_else(|| AgentError::Validation("skill file missing frontmatter delimiter".into()))?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| AgentError::Validation("skill file missing closing frontmatter delimiter".into()))?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');
    Ok((frontmatter, body))
}

pub fn parse_skill_file(raw: &str) -> Result<Skill, AgentError> {
    let (frontmatter_yaml, body) = split_frontmatter(raw)?;
    let frontmatter: Frontmatter = serde_yaml::from_str(frontmatter_yaml)
        .map_err(|e| AgentError::Validation(format!("skill frontmatter: {e}")))?;
    Ok(Skill {
        name: frontmatter.name,
        description: frontmatter.description,
        system_prompt: body.trim().to_string(),
        keywords: frontmatter.keywords,
    })
}

/// Loads every `*.md` file directly under `dir` as a [`Skill`]. A directory
/// that does not exist yields an empty list rather than an error, projects
/// with no custom skills still boot.
pub fn load_skills_dir(dir: impl AsRef<Path>) -> Result<Vec<Skill>, AgentError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut skills = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        skills.push(parse_skill_file(&raw)?);
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(skills)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frontmatter_and_body() {
        let raw = "---\nname: brainstorm\ndescription: Generate ideas\nkeywords: [brainstorm, ideate, explore]\n---\nYou are a brainstorming assistant.\n";
        let skill = parse_skill_file(raw).unwrap();
        assert_eq!(skill.name, "brainstorm");
        assert_eq!(skill.description, "Generate ideas");
        assert_eq!(skill.keywords, vec!["brainstorm", "ideate", "explore"]);
        assert_eq!(skill.system_prompt, "You are a brainstorming assistant.");
    }

    #[test]
    fn missing_frontmatter_is_rejected() {
        let err = parse_skill_file("no frontmatter here").unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let skills = load_skills_dir("/nonexistent/skills/dir").unwrap();
        assert!(skills.is_empty());
    }
}
