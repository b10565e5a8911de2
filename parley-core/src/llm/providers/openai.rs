//! OpenAI-compatible chat completions provider
//!
//! Works against any endpoint speaking the `/chat/completions` dialect,
//! including GitHub Models and Azure OpenAI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use crate::error::{ParleyError, Result};
use crate::llm::{
    CompletionError, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
    Message, MessageRole, ModelInfo, StreamEvent, TokenUsage, ToolCall, ToolDefinition,
};

/// Default endpoint (GitHub Models inference API)
pub const DEFAULT_BASE_URL: &str = "https://models.github.ai/inference";

/// Default model
pub const DEFAULT_MODEL: &str = "openai/gpt-4.1-mini";

/// Provider for OpenAI-compatible chat completion endpoints.
pub struct OpenAICompatibleProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAICompatibleProvider {
    /// Create a provider against the default endpoint.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Create with a custom base URL.
    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Use a preconfigured HTTP client (timeouts, proxies)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Create from environment variables.
    ///
    /// Reads from:
    /// - `GITHUB_TOKEN` or `OPENAI_API_KEY` - API key (required)
    /// - `PARLEY_MODEL` - Model name (optional)
    /// - `PARLEY_BASE_URL` - Custom base URL (optional)
    ///
    /// # Errors
    ///
    /// Returns an error if neither key variable is set.
    pub fn from_env(model: Option<impl Into<String>>) -> Result<Self> {
        let api_key = api_key_from_env().ok_or_else(|| {
            ParleyError::Configuration(
                "GITHUB_TOKEN or OPENAI_API_KEY environment variable not set".to_string(),
            )
        })?;

        let model = model
            .map(|m| m.into())
            .or_else(|| std::env::var("PARLEY_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let base_url =
            std::env::var("PARLEY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self::with_base_url(api_key, model, base_url))
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, request: &CompletionRequest, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: self.model.clone(),
            messages: convert_messages(&request.messages),
            tools: convert_tools(&request.tools),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    async fn post(
        &self,
        body: &OpenAIRequest,
    ) -> std::result::Result<reqwest::Response, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let detail = match serde_json::from_str::<OpenAIError>(&text) {
            Ok(error) => format!(
                "{} ({})",
                error.error.message,
                error
                    .error
                    .code
                    .or(error.error.error_type)
                    .unwrap_or_else(|| status.to_string())
            ),
            Err(_) => text,
        };

        let mut err = CompletionError::from_response(status, detail);
        if let Some(delay) = retry_after {
            err = err.with_retry_after(delay);
        }
        Err(err)
    }
}

fn api_key_from_env() -> Option<String> {
    ["GITHUB_TOKEN", "OPENAI_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty())
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAIToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAIFunctionDef,
}

#[derive(Serialize)]
struct OpenAIFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAIFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: Option<OpenAIMessageResponse>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    error: Option<OpenAIErrorDetail>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: Option<OpenAIDelta>,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCallDelta>,
}

#[derive(Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Deserialize)]
struct OpenAIFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Deserialize)]
struct OpenAIErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn convert_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|m| OpenAIMessage {
            role: role_name(m.role),
            content: if m.content.is_empty() && !m.tool_calls.is_empty() {
                None
            } else {
                Some(m.content.clone())
            },
            tool_calls: m
                .tool_calls
                .iter()
                .map(|call| OpenAIToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
            tool_call_id: m.tool_call_id.clone(),
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OpenAITool> {
    tools
        .iter()
        .map(|tool| OpenAITool {
            kind: "function",
            function: OpenAIFunctionDef {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        })
        .collect()
}

/// Accumulates tool-call fragments spread over stream chunks
///
/// Keyed by the server-sent index, so sparse or huge indices only cost one
/// entry each.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, ToolCall>,
}

impl ToolCallAccumulator {
    fn push(&mut self, delta: OpenAIToolCallDelta) {
        let call = self.calls.entry(delta.index).or_insert_with(|| ToolCall {
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = delta.id {
            call.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Option<Vec<ToolCall>> {
        let calls: Vec<ToolCall> = self
            .calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .collect();
        (!calls.is_empty()).then_some(calls)
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompatibleProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, CompletionError> {
        let body = self.build_request(request, false);
        let response = self.post(&body).await?;

        let openai_response: OpenAIResponse = response.json().await.map_err(|e| {
            CompletionError::transient(format!("Failed to parse completion response: {}", e))
        })?;

        let usage = openai_response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        let message = openai_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .ok_or_else(|| CompletionError::transient("Completion service returned no choices"))?;

        let content = message.content.unwrap_or_default();

        if message.tool_calls.is_empty() {
            return Ok(CompletionResponse::Text { content, usage });
        }

        let calls = message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        Ok(CompletionResponse::ToolCalls {
            content,
            calls,
            usage,
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionStream, CompletionError> {
        let body = self.build_request(request, true);
        let response = self.post(&body).await?;

        // Convert response bytes to a stream of lines
        let bytes_stream = response.bytes_stream();
        let reader = tokio_util::io::StreamReader::new(
            bytes_stream.map(|r| r.map_err(std::io::Error::other)),
        );
        let lines = tokio::io::BufReader::new(reader).lines();
        let mut lines_stream = LinesStream::new(lines);

        let stream = async_stream::stream! {
            let mut pending = ToolCallAccumulator::default();

            while let Some(line_result) = lines_stream.next().await {
                let line = match line_result {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(CompletionError::transient(format!("Stream read error: {}", e)));
                        return;
                    }
                };

                // SSE format: "data: {...}"
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    break;
                }

                let chunk = match serde_json::from_str::<OpenAIStreamChunk>(data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(CompletionError::transient(format!(
                            "Failed to parse stream chunk: {}",
                            e
                        )));
                        return;
                    }
                };

                if let Some(error) = chunk.error {
                    yield Err(CompletionError::transient(error.message));
                    return;
                }

                for choice in chunk.choices {
                    let Some(delta) = choice.delta else { continue };
                    if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                        yield Ok(StreamEvent::Delta(content));
                    }
                    for call in delta.tool_calls {
                        pending.push(call);
                    }
                }
            }

            if let Some(calls) = pending.finish() {
                yield Ok(StreamEvent::ToolCalls(calls));
            }
        };

        Ok(Box::pin(stream))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "openai-compatible".to_string(),
            model_name: self.model.clone(),
        }
    }
}
