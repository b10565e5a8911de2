//! Conversation sessions
//!
//! A [`SessionOrchestrator`] owns one conversation: it budgets the context,
//! retries failed calls, runs requested actions and recovers from
//! context-too-large rejections.
//!
//! # Example
//!
//! ```rust,no_run
//! use parley_core::llm::providers::OpenAICompatibleProvider;
//! use parley_core::session::SessionOrchestrator;
//! use std::sync::Arc;
//!
//! # async fn run() -> parley_core::Result<()> {
//! let provider = Arc::new(OpenAICompatibleProvider::from_env(None::<String>)?);
//! let mut session = SessionOrchestrator::new(provider);
//!
//! let reply = session.send("When does my passport expire?").await?;
//! println!("{reply}");
//! println!("{:?}", session.stats());
//! # Ok(())
//! # }
//! ```

mod config;
mod orchestrator;

pub use config::{BudgetConfig, CURRENT_DATE_PLACEHOLDER, DEFAULT_SYSTEM_PROMPT, SessionConfig};
pub use orchestrator::{
    OrchestratorState, SessionOrchestrator, SessionStats, fallback_reply, warning_chunk,
};
