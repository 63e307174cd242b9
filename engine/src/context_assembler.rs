//! Context Assembler (C6): builds a prompt-ready text block from
//! an entity collection under a token budget, with transparent ("glass box")
//! accounting of what made it in.

use std::collections::HashSet;
use std::sync::Arc;

use crate::entity_store::{Entity, EntityStoreError};
use crate::knowledge_graph::KnowledgeGraph;

const ATTRIBUTE_TRUNCATE_LEN: usize = 500;
const PREVIEW_LEN: usize = 120;
const MAX_NEIGHBOUR_NAMES: usize = 5;
const SEMANTIC_CANDIDATE_LIMIT: usize = 10;
const SEMANTIC_SCORE_BOOST: f64 = 0.3;

/// Cheap token estimate used throughout the core: 4 characters ≈ 1 token.
/// Callers that need precision must bring their own estimator.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

pub struct ContextRequest {
    pub query: String,
    pub explicit_ids: Vec<String>,
    pub explicit_types: Vec<String>,
    pub max_tokens: usize,
    pub include_relationships: bool,
}

impl ContextRequest {
    pub fn new(query: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            query: query.into(),
            explicit_ids: Vec::new(),
            explicit_types: Vec::new(),
            max_tokens,
            include_relationships: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BucketMeta {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub preview: String,
}

#[derive(Clone, Debug)]
pub struct ContextResult {
    pub text: String,
    pub token_estimate: usize,
    pub buckets: Vec<BucketMeta>,
    pub included_count: usize,
    pub truncated_count: usize,
}

struct Candidate {
    entity: Entity,
    from_semantic_search: bool,
}

struct RenderedCandidate {
    entity: Entity,
    block: String,
    score: f64,
}

pub struct ContextAssembler {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl ContextAssembler {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }

    pub async fn assemble(&self, request: ContextRequest) -> Result<ContextResult, EntityStoreError> {
        let candidates = self.collect_candidates(&request).await?;
        let rendered = self.render_candidates(candidates, &request).await?;
        let scored = self.score_candidates(rendered, &request.query);
        Ok(pack_into_budget(scored, request.max_tokens))
    }

    async fn collect_candidates(&self, request: &ContextRequest) -> Result<Vec<Candidate>, EntityStoreError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for id in &request.explicit_ids {
            if let Some(entity) = self.knowledge_graph.get_entity(id.clone()).await? {
                if seen.insert(entity.id.clone()) {
                    candidates.push(Candidate {
                        entity,
                        from_semantic_search: false,
                    });
                }
            }
        }

        for entity_type in &request.explicit_types {
            for entity in self.knowledge_graph.get_entities_by_type(entity_type.clone()).await? {
                if seen.insert(entity.id.clone()) {
                    candidates.push(Candidate {
                        entity,
                        from_semantic_search: false,
                    });
                }
            }
        }

        if !request.query.is_empty() {
            let hits = self
                .knowledge_graph
                .semantic_search(request.query.clone(), SEMANTIC_CANDIDATE_LIMIT)
                .await?;
            for hit in hits {
                if seen.insert(hit.entity.id.clone()) {
                    candidates.push(Candidate {
                        entity: hit.entity,
                        from_semantic_search: true,
                    });
                }
            }
        }

        Ok(candidates)
    }

    async fn render_candidates(
        &self,
        candidates: Vec<Candidate>,
        request: &ContextRequest,
    ) -> Result<Vec<(Candidate, String)>, EntityStoreError> {
        let mut rendered = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut block = format!("## {} ({})\n", candidate.entity.name, candidate.entity.entity_type);
            let mut keys: Vec<&String> = candidate.entity.attributes.keys().collect();
            keys.sort();
            for key in keys {
                let value = &candidate.entity.attributes[key];
                let rendered_value = render_attribute_value(value);
                block.push_str(&format!("{key}: {rendered_value}\n"));
            }
            if request.include_relationships {
                let neighbours = self
                    .knowledge_graph
                    .get_neighbors(candidate.entity.id.clone(), None)
                    .await?;
                if !neighbours.is_empty() {
                    let names: Vec<&str> = neighbours
                        .iter()
                        .take(MAX_NEIGHBOUR_NAMES)
                        .map(|e| e.name.as_str())
                        .collect();
                    block.push_str(&format!("relates to: {}\n", names.join(", ")));
                }
            }
            rendered.push((candidate, block));
        }
        Ok(rendered)
    }

    fn score_candidates(
        &self,
        rendered: Vec<(Candidate, String)>,
        query: &str,
    ) -> Vec<RenderedCandidate> {
        let query_words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        rendered
            .into_iter()
            .map(|(candidate, block)| {
                let score = lexical_overlap_score(&block, &query_words);
                let score = if candidate.from_semantic_search {
                    (score + SEMANTIC_SCORE_BOOST).min(1.0)
                } else {
                    score
                };
                RenderedCandidate {
                    entity: candidate.entity,
                    block,
                    score,
                }
            })
            .collect()
    }
}

fn render_attribute_value(value: &serde_json::Value) -> String {
    let rendered = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() > ATTRIBUTE_TRUNCATE_LEN {
        let truncated: String = rendered.chars().take(ATTRIBUTE_TRUNCATE_LEN).collect();
        format!("{truncated}…")
    } else {
        rendered
    }
}

fn lexical_overlap_score(block: &str, query_words: &[String]) -> f64 {
    if query_words.is_empty() {
        return 0.0;
    }
    let block_lower = block.to_lowercase();
    let present = query_words.iter().filter(|w| block_lower.contains(w.as_str())).count();
    present as f64 / query_words.len() as f64
}

fn pack_into_budget(mut scored: Vec<RenderedCandidate>, max_tokens: usize) -> ContextResult {
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut text = String::new();
    let mut buckets = Vec::new();
    let mut token_estimate = 0usize;
    let mut included_count = 0usize;
    let mut truncated_count = 0usize;

    for candidate in scored {
        let cost = estimate_tokens(&candidate.block);
        if token_estimate + cost > max_tokens {
            truncated_count += 1;
            continue;
        }
        token_estimate += cost;
        included_count += 1;
        text.push_str(&candidate.block);
        text.push('\n');
        let preview: String = candidate.block.chars().take(PREVIEW_LEN).collect();
        buckets.push(BucketMeta {
            id: candidate.entity.id,
            name: candidate.entity.name,
            entity_type: candidate.entity.entity_type,
            preview,
        });
    }

    ContextResult {
        text,
        token_estimate,
        buckets,
        included_count,
        truncated_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn entity(id: &str, name: &str) -> Entity {
        let now = Utc::now();
        Entity {
            id: id.to_string(),
            entity_type: "character".to_string(),
            name: name.to_string(),
            attributes: HashMap::new(),
            parent_id: None,
            sort_order: 0,
            tags: vec![],
            relationships: vec![],
            era_id: None,
            parent_version_id: None,
            model_preference: None,
            content_hash: "h".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn lexical_overlap_counts_fraction_of_query_words_present() {
        let score = lexical_overlap_score("the dragon guards the library", &["dragon".into(), "castle".into()]);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn semantic_hits_get_a_capped_score_boost() {
        let rendered = vec![
            (
                Candidate {
                    entity: entity("e1", "Aria"),
                    from_semantic_search: true,
                },
                "## Aria (character)\n".to_string(),
            ),
        ];
        let assembler_score = lexical_overlap_score(&rendered[0].1, &[]);
        assert_eq!(assembler_score, 0.0);
        let boosted = (assembler_score + SEMANTIC_SCORE_BOOST).min(1.0);
        assert_eq!(boosted, SEMANTIC_SCORE_BOOST);
    }

    #[test]
    fn pack_into_budget_drops_low_scoring_overflow_and_counts_truncation() {
        let big_block = "x".repeat(4000);
        let scored = vec![
            RenderedCandidate {
                entity: entity("e1", "First"),
                block: big_block.clone(),
                score: 0.9,
            },
            RenderedCandidate {
                entity: entity("e2", "Second"),
                block: big_block,
                score: 0.1,
            },
        ];
        let result = pack_into_budget(scored, 500);
        assert_eq!(result.included_count, 1);
        assert_eq!(result.truncated_count, 1);
        assert_eq!(result.buckets[0].id, "e1");
    }

    #[test]
    fn attribute_values_over_the_limit_are_truncated_with_an_ellipsis() {
        let long = serde_json::Value::String("a".repeat(600));
        let rendered = render_attribute_value(&long);
        assert!(rendered.ends_with('…'));
        assert_eq!(rendered.chars().count(), ATTRIBUTE_TRUNCATE_LEN + 1);
    }
}
