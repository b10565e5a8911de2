//! Conversation state
//!
//! Turn history, size estimation and summarization.
//!
//! # Example
//!
//! ```rust
//! use parley_core::conversation::{ConversationState, Turn};
//!
//! let mut state = ConversationState::new();
//! let estimator = *state.estimator();
//! state.append(Turn::user("Add my passport, it expires in May.", &estimator));
//! state.append(Turn::assistant("Saved.", &estimator));
//!
//! state.compact("User added a passport record.", true);
//! assert_eq!(state.turn_count(), 1);
//! ```

mod estimator;
mod history;
mod state;
mod summarizer;

pub use estimator::{CHARS_PER_UNIT, TokenBudgetEstimator, truncate_chars};
pub use history::{Turn, TurnRole};
pub use state::{ConversationState, SUMMARY_MAX_CHARS, SUMMARY_PREFIX, TRUNCATION_MARKER};
pub use summarizer::{FALLBACK_SUMMARY, Summarizer, SummarizerConfig};
