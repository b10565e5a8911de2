//! Best-effort condensation of older turns

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::estimator::truncate_chars;
use super::history::Turn;
use crate::llm::{CompletionProvider, CompletionRequest, Message};

/// Returned whenever the summary call fails or comes back empty
pub const FALLBACK_SUMMARY: &str =
    "Earlier parts of this conversation were condensed and are no longer available in detail.";

const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation below in a few sentences. \
Keep names, dates, amounts and any commitments the assistant made. \
Write plain prose without headings.";

/// Summarizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Most recent turns included in the request
    pub max_turns: usize,
    /// Per-turn character cap before inclusion
    pub max_chars_per_turn: usize,
    /// Output ceiling for the summary call
    pub max_tokens: usize,
    /// Sampling temperature for the summary call
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_chars_per_turn: 500,
            max_tokens: 300,
            temperature: 0.3,
        }
    }
}

/// Condenses history into a short synopsis with one extra completion call.
///
/// Never fails: any error becomes [`FALLBACK_SUMMARY`].
pub struct Summarizer {
    provider: Arc<dyn CompletionProvider>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::with_config(provider, SummarizerConfig::default())
    }

    pub fn with_config(provider: Arc<dyn CompletionProvider>, config: SummarizerConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Summarize `turns`, folding in `previous` so the result still
    /// precedes whatever is retained after compaction.
    pub async fn summarize(&self, previous: Option<&str>, turns: &[Turn]) -> String {
        let request = self.build_request(previous, turns);

        match self.provider.complete(&request).await {
            Ok(response) => match response.text_content().map(str::trim) {
                Some(text) if !text.is_empty() => {
                    debug!(chars = text.len(), turns = turns.len(), "Conversation summarized");
                    text.to_string()
                }
                _ => {
                    warn!("Summary call returned no text, using fallback summary");
                    FALLBACK_SUMMARY.to_string()
                }
            },
            Err(e) => {
                warn!(error = %e, class = %e.class, "Summary call failed, using fallback summary");
                FALLBACK_SUMMARY.to_string()
            }
        }
    }

    fn build_request(&self, previous: Option<&str>, turns: &[Turn]) -> CompletionRequest {
        let start = turns.len().saturating_sub(self.config.max_turns);
        let mut transcript = String::new();

        if let Some(previous) = previous.filter(|p| !p.is_empty()) {
            transcript.push_str("Earlier summary: ");
            transcript.push_str(previous);
            transcript.push_str("\n\n");
        }

        for turn in &turns[start..] {
            let content = turn.content();
            let capped = truncate_chars(content, self.config.max_chars_per_turn);
            transcript.push_str(&turn.role().to_string());
            transcript.push_str(": ");
            transcript.push_str(capped);
            if capped.len() < content.len() {
                transcript.push_str("...");
            }
            transcript.push('\n');
        }

        CompletionRequest::new(vec![
            Message::system(SUMMARY_INSTRUCTIONS),
            Message::user(transcript),
        ])
        .with_temperature(self.config.temperature)
        .with_max_tokens(self.config.max_tokens)
    }
}
