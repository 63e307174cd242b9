//! Deterministic, non-semantic embedding fallback.
//!
//! Used when the configured [`super::EmbeddingProvider`] is unavailable.
//! Hashes whitespace-split tokens into fixed-size buckets (the classic
//! "hashing trick") and L2-normalises the result. Two texts sharing
//! vocabulary land closer together than two that don't, but this carries
//! none of a real embedding model's semantics, it exists purely so
//! `semantic_search` degrades to *something* ordered instead of failing
//! outright, and so the vector index never falls behind the relational
//! index in cardinality.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingProvider;
use crate::error::AgentError;

const DIMENSIONS: usize = 256;

pub struct DeterministicEmbedder;

impl DeterministicEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; DIMENSIONS];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % DIMENSIONS;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for DeterministicEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        DIMENSIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_embeds_identically() {
        let embedder = DeterministicEmbedder::new();
        let a = embedder.embed(&["the quick brown fox"]).await.unwrap();
        let b = embedder.embed(&["the quick brown fox"]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn shared_vocabulary_is_closer_than_disjoint_vocabulary() {
        let embedder = DeterministicEmbedder::new();
        let vectors = embedder
            .embed(&[
                "dragons guard the ancient library",
                "dragons guard the old archive",
                "quarterly tax filing instructions",
            ])
            .await
            .unwrap();

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        let sim_related = dot(&vectors[0], &vectors[1]);
        let sim_unrelated = dot(&vectors[0], &vectors[2]);
        assert!(sim_related > sim_unrelated);
    }

    #[tokio::test]
    async fn vectors_are_unit_dimension_and_normalised() {
        let embedder = DeterministicEmbedder::new();
        let vectors = embedder.embed(&["hello world"]).await.unwrap();
        assert_eq!(vectors[0].len(), embedder.dimension());
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
