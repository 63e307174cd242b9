//! Tool registry for the agent dispatcher's ReAct loop:
//! `{name, description, handler: string -> string}`, a plain string-in/
//! string-out handler contract rather than a JSON-schema/MCP-shaped one. A
//! handler that throws is captured as an observation, not a fatal error --
//! it lets the model recover.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arg: String) -> Result<String, String>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String, String>> + Send,
{
    async fn call(&self, arg: String) -> Result<String, String> {
        (self)(arg).await
    }
}

pub struct RegisteredTool {
    pub name: String,
    pub description: String,
    pub handler: Arc<dyn ToolHandler>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) {
        let name = name.into();
        self.tools.insert(
            name.clone(),
            RegisteredTool {
                name,
                description: description.into(),
                handler,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// "Available tools" preamble appended to a skill's system prompt.
    pub fn preamble(&self) -> String {
        if self.tools.is_empty() {
            return String::new();
        }
        let mut names: Vec<&RegisteredTool> = self.tools.values().collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));
        let mut text = String::from("Available tools:\n");
        for tool in names {
            text.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
        text
    }

    /// Dispatches `name("arg")`. Handler failures are returned as `Ok` text
    /// prefixed for the observation, never propagated as a fatal error --
    /// "the tool's exception becomes an observation".
    pub async fn dispatch(&self, name: &str, arg: String) -> String {
        match self.tools.get(name) {
            Some(tool) => match tool.handler.call(arg).await {
                Ok(result) => result,
                Err(e) => format!("Error: {e}"),
            },
            None => format!("Error: unknown tool '{name}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_calls_registered_handler() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            "echoes its argument",
            Arc::new(|arg: String| async move { Ok(format!("echoed: {arg}")) }),
        );
        let result = registry.dispatch("echo", "hello".into()).await;
        assert_eq!(result, "echoed: hello");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_an_observation_not_a_panic() {
        let registry = ToolRegistry::new();
        let result = registry.dispatch("nope", "x".into()).await;
        assert!(result.starts_with("Error: unknown tool"));
    }

    #[tokio::test]
    async fn handler_error_becomes_an_observation() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "fail",
            "always fails",
            Arc::new(|_: String| async move { Err("boom".to_string()) }),
        );
        let result = registry.dispatch("fail", String::new()).await;
        assert_eq!(result, "Error: boom");
    }

    #[test]
    fn preamble_lists_tools_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register("zeta", "last", Arc::new(|a: String| async move { Ok(a) }));
        registry.register("alpha", "first", Arc::new(|a: String| async move { Ok(a) }));
        let preamble = registry.preamble();
        assert!(preamble.find("alpha").unwrap() < preamble.find("zeta").unwrap());
    }
}
