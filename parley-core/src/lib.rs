//! # Parley - conversational session orchestration
//!
//! Parley turns a sequence of user messages into calls against a remote
//! language-model completion service while:
//! - keeping the exchanged context inside a hard size budget
//! - summarizing older turns when the budget runs out
//! - retrying rate-limited and transient failures with exponential backoff
//! - recovering from context-too-large rejections by compacting and retrying
//! - running catalog actions the service asks for mid-exchange
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     parley_core::telemetry::ensure_initialized();
//!
//!     let config = ParleyConfig::load()?;
//!     let provider = Arc::new(config.llm.build_provider()?);
//!     let mut session =
//!         SessionOrchestrator::from_config(provider, Arc::new(ToolDispatcher::new()), &config);
//!
//!     let reply = session.send("Which subscriptions renew this month?").await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **conversation**: turns, size estimation, summary and compaction
//! - **llm**: provider trait, failure classification, retry executor
//! - **tools**: typed catalog actions and the dispatcher
//! - **session**: the orchestrator and its overflow-recovery state machine

pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod session;
pub mod telemetry;
pub mod tools;

pub use error::{ParleyError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LlmConfig, ParleyConfig};
    pub use crate::conversation::{
        ConversationState, Summarizer, SummarizerConfig, TokenBudgetEstimator, Turn, TurnRole,
    };
    pub use crate::error::{ParleyError, Result};
    pub use crate::llm::providers::OpenAICompatibleProvider;
    pub use crate::llm::{
        CompletionError, CompletionProvider, CompletionRequest, CompletionResponse,
        CompletionStream, FailureClass, Message, MessageRole, RetryExecutor, RetryPolicy,
        StreamEvent, ToolCall, ToolDefinition,
    };
    pub use crate::session::{
        BudgetConfig, OrchestratorState, SessionConfig, SessionOrchestrator, SessionStats,
    };
    pub use crate::tools::{
        FnTool, ParamSpec, ParamType, Tool, ToolArgs, ToolDispatcher, ToolError, ToolMetadata,
    };
}
