//! OpenAI Embeddings implementation of [`EmbeddingProvider`].
//!
//! Default model `text-embedding-3-small` (1536 dimensions). Requires
//! `OPENAI_API_KEY` (or a custom [`OpenAIConfig`]) at call time.

use async_openai::{
    config::OpenAIConfig,
    types::embeddings::{CreateEmbeddingRequest, EmbeddingInput},
    Client,
};

use super::EmbeddingProvider;
use crate::error::AgentError;

pub struct OpenAIEmbedder {
    config: OpenAIConfig,
    model: String,
    dimensions: usize,
}

impl OpenAIEmbedder {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let dimensions = Self::model_dimensions(&model);
        Self {
            config: OpenAIConfig::new(),
            model,
            dimensions,
        }
    }

    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimensions = Self::model_dimensions(&model);
        Self {
            config,
            model,
            dimensions,
        }
    }

    fn model_dimensions(model: &str) -> usize {
        match model {
            "text-embedding-3-large" => 3072,
            "text-embedding-3-small" | "text-embedding-ada-002" => 1536,
            _ => 1536,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, AgentError> {
        let inputs: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        let input = if inputs.len() == 1 {
            EmbeddingInput::String(inputs[0].clone())
        } else {
            EmbeddingInput::StringArray(inputs)
        };
        let request = CreateEmbeddingRequest {
            input,
            model: self.model.clone(),
            ..Default::default()
        };

        let client = Client::with_config(self.config.clone());
        let response = client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| AgentError::Llm(format!("embedding provider error: {e}")))?;

        Ok(response.data.into_iter().map(|e| e.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_dimensions_match_known_models() {
        assert_eq!(OpenAIEmbedder::model_dimensions("text-embedding-3-small"), 1536);
        assert_eq!(OpenAIEmbedder::model_dimensions("text-embedding-3-large"), 3072);
        assert_eq!(OpenAIEmbedder::model_dimensions("text-embedding-ada-002"), 1536);
        assert_eq!(OpenAIEmbedder::model_dimensions("unknown-model"), 1536);
    }

    #[test]
    fn constructors_resolve_dimension_from_model() {
        let embedder = OpenAIEmbedder::new("text-embedding-3-small");
        assert_eq!(embedder.dimension(), 1536);
        let embedder = OpenAIEmbedder::new("text-embedding-3-large");
        assert_eq!(embedder.dimension(), 3072);
    }

    #[tokio::test]
    #[ignore = "requires OPENAI_API_KEY"]
    async fn embeds_real_text_against_the_api() {
        std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY must be set for this test");
        let embedder = OpenAIEmbedder::new("text-embedding-3-small");
        let vectors = embedder
            .embed(&["hello, world!", "the quick brown fox"])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 1536);
    }
}
