//! Registry and uniform invocation entry point for catalog actions
//!
//! The dispatcher provides:
//! - Registration with duplicate detection
//! - Tool definitions for outbound requests
//! - `invoke(name, args)` that always returns text
//!
//! # Example
//!
//! ```rust,ignore
//! let mut dispatcher = ToolDispatcher::new();
//! dispatcher.register(Arc::new(ListDocumentsTool::new(store)))?;
//!
//! let text = dispatcher.invoke("list_documents", "{}").await;
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::tool::{Tool, ToolError};
use crate::llm::ToolDefinition;

/// Catalog of actions the completion service may request
#[derive(Default)]
pub struct ToolDispatcher {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action
    ///
    /// Returns an error if an action with the same name is already registered.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register multiple actions, stopping at the first duplicate
    pub fn register_all(&mut self, tools: Vec<Arc<dyn Tool>>) -> Result<(), ToolError> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for every registered action, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| tool.metadata().definition())
            .collect()
    }

    /// Run an action by name with raw JSON arguments.
    ///
    /// Never fails: unknown names, malformed or invalid arguments and action
    /// errors all come back as an `Error: ...` string.
    pub async fn invoke(&self, name: &str, arguments: &str) -> String {
        match self.try_invoke(name, arguments).await {
            Ok(text) => {
                debug!(tool = name, chars = text.len(), "Action completed");
                text
            }
            Err(e) => {
                warn!(tool = name, error = %e, "Action failed");
                format!("Error: {e}")
            }
        }
    }

    async fn try_invoke(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let raw = parse_arguments(arguments)?;
        let args = tool.metadata().validate(raw)?;
        tool.call(args).await
    }
}

fn parse_arguments(arguments: &str) -> Result<Map<String, Value>, ToolError> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(_) => Err(ToolError::InvalidArguments(vec![
            "arguments must be a JSON object".to_string(),
        ])),
        Err(e) => Err(ToolError::InvalidArguments(vec![format!(
            "arguments are not valid JSON: {e}"
        )])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FnTool, ParamSpec, ParamType, ToolMetadata};
    use futures::FutureExt;

    fn spending_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolMetadata::new("get_spending_summary", "Total monthly subscription cost")
                .with_param(
                    ParamSpec::optional("currency", ParamType::String, "ISO currency code")
                        .with_default("USD"),
                ),
            |args| {
                let currency = args.str("currency").unwrap_or_default().to_string();
                async move { Ok(format!("Total: 42.00 {currency}")) }.boxed()
            },
        ))
    }

    fn failing_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolMetadata::new("delete_document", "Delete a document")
                .with_param(ParamSpec::required("name", ParamType::String, "Document name")),
            |_args| async move { Err(ToolError::execution("document not found")) }.boxed(),
        ))
    }

    fn dispatcher() -> ToolDispatcher {
        let mut dispatcher = ToolDispatcher::new();
        dispatcher
            .register_all(vec![spending_tool(), failing_tool()])
            .unwrap();
        dispatcher
    }

    #[test]
    fn test_duplicate_registration() {
        let mut dispatcher = dispatcher();
        let err = dispatcher.register(spending_tool()).unwrap_err();
        assert_eq!(err, ToolError::Duplicate("get_spending_summary".to_string()));
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn test_definitions_sorted() {
        let definitions = dispatcher().definitions();
        let names: Vec<_> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["delete_document", "get_spending_summary"]);
        assert_eq!(definitions[0].parameters["required"][0], "name");
    }

    #[tokio::test]
    async fn test_invoke_with_defaults() {
        let text = dispatcher().invoke("get_spending_summary", "").await;
        assert_eq!(text, "Total: 42.00 USD");

        let text = dispatcher()
            .invoke("get_spending_summary", r#"{"currency":"EUR"}"#)
            .await;
        assert_eq!(text, "Total: 42.00 EUR");
    }

    #[tokio::test]
    async fn test_failures_become_text() {
        let dispatcher = dispatcher();

        let unknown = dispatcher.invoke("send_email", "{}").await;
        assert_eq!(unknown, "Error: unknown action 'send_email'");

        let malformed = dispatcher.invoke("delete_document", "{not json").await;
        assert!(malformed.starts_with("Error: invalid arguments: arguments are not valid JSON"));

        let missing = dispatcher.invoke("delete_document", "{}").await;
        assert!(missing.contains("missing required parameter 'name'"));

        let failed = dispatcher
            .invoke("delete_document", r#"{"name":"Passport"}"#)
            .await;
        assert_eq!(failed, "Error: document not found");
    }

    #[tokio::test]
    async fn test_non_object_arguments() {
        let text = dispatcher().invoke("get_spending_summary", "[1,2]").await;
        assert_eq!(text, "Error: invalid arguments: arguments must be a JSON object");
    }
}
