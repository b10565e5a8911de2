//! Catalog action trait and argument schema
//!
//! Each action declares a typed parameter list. The dispatcher validates
//! incoming arguments against it and fills in defaults before the action
//! runs, so implementations read already-checked values from [`ToolArgs`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::Arc;

use crate::llm::ToolDefinition;

/// Errors raised by actions and by the dispatcher's validation step.
///
/// These never cross into the orchestrator as errors; the dispatcher turns
/// them into text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    /// Arguments failed schema validation
    #[error("invalid arguments: {}", .0.join("; "))]
    InvalidArguments(Vec<String>),

    /// The action ran and failed
    #[error("{0}")]
    Execution(String),

    /// No action with this name
    #[error("unknown action '{0}'")]
    NotFound(String),

    /// An action with this name is already registered
    #[error("action '{0}' is already registered")]
    Duplicate(String),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

/// JSON type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// JSON Schema type name
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Whether `value` has this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.json_type())
    }
}

/// One named parameter of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    /// Value used when an optional parameter is omitted
    pub default: Option<Value>,
}

impl ParamSpec {
    /// A parameter the caller must supply
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    /// A parameter the caller may omit
    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Action metadata used for discovery and request building
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Unique action name
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// JSON Schema object describing the parameters
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.params {
            let mut property = json!({
                "type": param.param_type.json_type(),
                "description": param.description,
            });
            if let Some(default) = &param.default {
                property["default"] = default.clone();
            }
            properties.insert(param.name.clone(), property);
        }

        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Definition sent to the completion service
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema(),
        }
    }

    /// Check `raw` against the parameter list and apply defaults.
    ///
    /// Unknown keys are dropped.
    pub fn validate(&self, raw: Map<String, Value>) -> Result<ToolArgs, ToolError> {
        let mut raw = raw;
        let mut values = Map::new();
        let mut problems = Vec::new();

        for param in &self.params {
            match raw.remove(&param.name) {
                Some(Value::Null) | None => {
                    if let Some(default) = &param.default {
                        values.insert(param.name.clone(), default.clone());
                    } else if param.required {
                        problems.push(format!("missing required parameter '{}'", param.name));
                    }
                }
                Some(value) if param.param_type.matches(&value) => {
                    values.insert(param.name.clone(), value);
                }
                Some(_) => problems.push(format!(
                    "parameter '{}' must be of type {}",
                    param.name, param.param_type
                )),
            }
        }

        if problems.is_empty() {
            Ok(ToolArgs { values })
        } else {
            Err(ToolError::InvalidArguments(problems))
        }
    }
}

/// Validated arguments handed to an action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    values: Map<String, Value>,
}

impl ToolArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// A string argument the schema marks as required
    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        self.str(name)
            .ok_or_else(|| ToolError::InvalidArguments(vec![format!("'{name}' is required")]))
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.values
    }
}

/// A named, typed catalog action.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get tool metadata
    fn metadata(&self) -> &ToolMetadata;

    /// Get tool name (convenience method)
    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Run the action with validated arguments, returning text for the model
    async fn call(&self, args: ToolArgs) -> Result<String, ToolError>;
}

type Handler = dyn Fn(ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync;

/// Action backed by a closure
pub struct FnTool {
    metadata: ToolMetadata,
    handler: Box<Handler>,
}

impl FnTool {
    pub fn new<F>(metadata: ToolMetadata, handler: F) -> Self
    where
        F: Fn(ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync + 'static,
    {
        Self {
            metadata,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, args: ToolArgs) -> Result<String, ToolError> {
        (self.handler)(args).await
    }
}

/// Type alias for shared tools
pub type BoxedTool = Arc<dyn Tool>;
