//! Completion service boundary
//!
//! Request/response types, the [`CompletionProvider`] trait implemented by
//! remote backends, failure classification and the retry executor.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod failure;
pub mod providers;
pub mod retry;

pub use failure::{CompletionError, FailureClass};
pub use retry::{RetryExecutor, RetryPolicy, RetryState, Sleeper, TokioSleeper};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A catalog action the completion service asked to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Service-assigned call identifier, echoed back with the result
    pub id: String,
    /// Catalog action name
    pub name: String,
    /// Raw JSON arguments as produced by the model
    pub arguments: String,
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Which call a tool message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    /// Assistant message carrying tool calls
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(MessageRole::Assistant, content)
        }
    }

    /// Result of a tool call, fed back to the service
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(MessageRole::Tool, content)
        }
    }
}

/// Catalog action description sent with a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments
    pub parameters: serde_json::Value,
}

/// Request to a completion provider
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Messages in the conversation
    pub messages: Vec<Message>,

    /// Actions the service may ask to invoke
    pub tools: Vec<ToolDefinition>,

    /// Temperature for generation (0.0-2.0)
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    pub max_tokens: Option<usize>,

    /// Remote thread/session handle for services that track one
    pub thread_id: Option<String>,
}

impl CompletionRequest {
    /// Create a request from a message list
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Create a request with system prompt
    pub fn with_system_prompt(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self::new(vec![Message::system(system_prompt), Message::user(user_prompt)])
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Response from a completion provider
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResponse {
    /// Final assistant text
    Text {
        content: String,
        usage: Option<TokenUsage>,
    },
    /// The service wants catalog actions run before it answers
    ToolCalls {
        /// Any text emitted alongside the calls
        content: String,
        calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
    },
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::ToolCalls {
            content: String::new(),
            calls,
            usage: None,
        }
    }

    /// Final text, when the service answered without requesting tools
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Self::Text { content, .. } => Some(content),
            Self::ToolCalls { .. } => None,
        }
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        match self {
            Self::Text { usage, .. } | Self::ToolCalls { usage, .. } => usage.as_ref(),
        }
    }
}

/// One item of a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text fragment; fragments concatenate to the full answer
    Delta(String),
    /// Tool calls, emitted once after the service finished requesting them
    ToolCalls(Vec<ToolCall>),
}

/// Stream of completion events
pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, CompletionError>> + Send>>;

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
}

/// Trait for completion service implementations.
///
/// Implementors classify every failure into a [`FailureClass`]; the retry
/// executor and session orchestrator depend on that classification.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Run one non-streaming completion
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;

    /// Run one streaming completion.
    ///
    /// The default implementation performs a blocking [`complete`](Self::complete)
    /// and replays it as a single-item stream.
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionStream, CompletionError> {
        let event = match self.complete(request).await? {
            CompletionResponse::Text { content, .. } => StreamEvent::Delta(content),
            CompletionResponse::ToolCalls { calls, .. } => StreamEvent::ToolCalls(calls),
        };
        Ok(Box::pin(futures::stream::iter(vec![Ok(event)])))
    }

    /// Get model information
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "unknown".to_string(),
            model_name: "unknown".to_string(),
        }
    }
}
