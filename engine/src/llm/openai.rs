//! OpenAI-compatible Chat Completions client implementing [`LlmClient`].
//!
//! Model/temperature/max_tokens are resolved per call by the C7 model config
//! cascade and passed in via [`super::LlmCallParams`] rather than fixed at
//! construction time, a single `ChatOpenAI` instance serves every pipeline
//! step and chat turn regardless of which model each one resolves to.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
    },
    Client,
};

use super::{LlmCallParams, LlmClient, LlmResponse, LlmUsage, MessageChunk};
use crate::error::AgentError;
use crate::message::Message;

pub struct ChatOpenAI {
    client: Client<OpenAIConfig>,
}

impl ChatOpenAI {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_config(config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
        }
    }

    fn messages_to_request(messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System(s) => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(s.as_str()),
                ),
                Message::User(s) => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(s.as_str()),
                ),
                Message::Assistant(s) => {
                    ChatCompletionRequestMessage::Assistant((s.as_str()).into())
                }
            })
            .collect()
    }
}

impl Default for ChatOpenAI {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ChatOpenAI {
    async fn invoke(
        &self,
        messages: &[Message],
        params: &LlmCallParams,
    ) -> Result<LlmResponse, AgentError> {
        let openai_messages = Self::messages_to_request(messages);
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(params.model.clone());
        args.messages(openai_messages);
        if let Some(t) = params.temperature {
            args.temperature(t);
        }
        if let Some(m) = params.max_tokens {
            args.max_tokens(m);
        }
        let request = args
            .build()
            .map_err(|e| AgentError::Llm(format!("request build failed: {e}")))?;

        debug!(model = %params.model, message_count = messages.len(), "chat completion request");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AgentError::Llm(format!("provider call failed: {e}")))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Llm("provider returned no choices".to_string()))?;
        let content = choice.message.content.unwrap_or_default();
        let usage = response.usage.map(|u| LlmUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        trace!(content_len = content.len(), "chat completion response");
        Ok(LlmResponse { content, usage })
    }

    async fn invoke_stream(
        &self,
        messages: &[Message],
        params: &LlmCallParams,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, AgentError> {
        let Some(chunk_tx) = chunk_tx else {
            return self.invoke(messages, params).await;
        };

        let openai_messages = Self::messages_to_request(messages);
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(params.model.clone());
        args.messages(openai_messages);
        args.stream(true);
        if let Some(t) = params.temperature {
            args.temperature(t);
        }
        if let Some(m) = params.max_tokens {
            args.max_tokens(m);
        }
        let request = args
            .build()
            .map_err(|e| AgentError::Llm(format!("request build failed: {e}")))?;

        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| AgentError::Llm(format!("provider stream failed: {e}")))?;

        let mut full_content = String::new();
        let mut usage: Option<LlmUsage> = None;
        while let Some(result) = stream.next().await {
            let response =
                result.map_err(|e| AgentError::Llm(format!("provider stream error: {e}")))?;
            if let Some(u) = response.usage {
                usage = Some(LlmUsage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });
            }
            for choice in response.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        full_content.push_str(&content);
                        let _ = chunk_tx.send(MessageChunk { content }).await;
                    }
                }
            }
        }

        Ok(LlmResponse {
            content: full_content,
            usage,
        })
    }
}
