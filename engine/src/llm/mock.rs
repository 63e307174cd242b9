//! Fixed/scripted responses for tests and offline fixtures.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{LlmCallParams, LlmClient, LlmResponse};
use crate::error::AgentError;
use crate::message::Message;

/// Returns canned responses in order, repeating the last one once exhausted.
/// Records every call's messages for assertions.
pub struct MockLlm {
    responses: Mutex<Vec<String>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlm {
    pub fn new(responses: Vec<impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<Vec<Message>> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn invoke(
        &self,
        messages: &[Message],
        _params: &LlmCallParams,
    ) -> Result<LlmResponse, AgentError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let mut responses = self.responses.lock().unwrap();
        let content = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses.first().cloned().unwrap_or_default()
        };
        Ok(LlmResponse {
            content,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_responses_in_order_then_repeats_last() {
        let llm = MockLlm::new(vec!["a", "b"]);
        let params = LlmCallParams::default();
        assert_eq!(llm.invoke(&[], &params).await.unwrap().content, "a");
        assert_eq!(llm.invoke(&[], &params).await.unwrap().content, "b");
        assert_eq!(llm.invoke(&[], &params).await.unwrap().content, "b");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn records_calls_for_assertions() {
        let llm = MockLlm::fixed("ok");
        llm.invoke(&[Message::user("hi")], &LlmCallParams::default())
            .await
            .unwrap();
        assert_eq!(llm.last_call().unwrap(), vec![Message::user("hi")]);
    }
}
