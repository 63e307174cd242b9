//! Embedding provider interface: `seq<string> → seq<vector<float>>`.
//!
//! [`EmbeddingProvider`] is injected into the vector index (C3). On provider
//! failure, C3 falls back to [`DeterministicEmbedder`] so the index never
//! diverges from the relational index in cardinality, see
//! [`crate::entity_store::vector_index`].

mod deterministic;
mod openai;

pub use deterministic::DeterministicEmbedder;
pub use openai::OpenAIEmbedder;

use async_trait::async_trait;

use crate::error::AgentError;

/// Produces fixed-size float vectors from text for upsert and query.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds each text into a vector of dimension [`EmbeddingProvider::dimension`].
    /// Returns one vector per input text, same order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError>;

    /// Vector dimension returned by [`EmbeddingProvider::embed`].
    fn dimension(&self) -> usize;
}
