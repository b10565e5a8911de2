//! Error types for Parley operations

use crate::llm::CompletionError;
use crate::tools::ToolError;

/// Result type for Parley operations
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Error types for the Parley orchestrator
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    /// Completion service call failed after classification and retries
    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Tool registration error
    #[error("Tool error: {0}")]
    Tool(String),

    /// The completion service kept requesting tools past the round limit
    #[error("Tool round limit of {0} exceeded")]
    ToolRoundLimit(usize),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// The completion failure behind this error, if any
    pub fn as_completion(&self) -> Option<&CompletionError> {
        match self {
            ParleyError::Completion(err) => Some(err),
            _ => None,
        }
    }
}

impl From<String> for ParleyError {
    fn from(s: String) -> Self {
        ParleyError::Other(s)
    }
}

impl From<&str> for ParleyError {
    fn from(s: &str) -> Self {
        ParleyError::Other(s.to_string())
    }
}

impl From<ToolError> for ParleyError {
    fn from(err: ToolError) -> Self {
        ParleyError::Tool(err.to_string())
    }
}

impl From<anyhow::Error> for ParleyError {
    fn from(err: anyhow::Error) -> Self {
        ParleyError::Other(err.to_string())
    }
}

impl From<figment::Error> for ParleyError {
    fn from(err: figment::Error) -> Self {
        ParleyError::Configuration(err.to_string())
    }
}
