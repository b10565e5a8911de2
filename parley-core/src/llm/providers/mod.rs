//! Completion provider implementations

mod openai;

pub use openai::{DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAICompatibleProvider};
