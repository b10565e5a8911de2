//! Turn history plus rolling summary

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::estimator::{TokenBudgetEstimator, truncate_chars};
use super::history::Turn;
use crate::llm::Message;

/// Longest summary kept, in characters
pub const SUMMARY_MAX_CHARS: usize = 2000;

/// Appended to content cut by [`ConversationState::truncate_turn`]
pub const TRUNCATION_MARKER: &str = " [...truncated]";

/// Prefix of the system message carrying the summary
pub const SUMMARY_PREFIX: &str = "Summary of earlier conversation:\n";

/// Ordered turns of one conversation and the summary that precedes them.
///
/// Owned by exactly one session. The summary, when present, stands in for
/// everything older than the first retained turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    session_id: String,
    thread_id: String,
    turns: Vec<Turn>,
    summary: Option<String>,
    #[serde(skip)]
    estimator: TokenBudgetEstimator,
}

impl ConversationState {
    /// Empty state with fresh session and thread identifiers
    pub fn new() -> Self {
        Self::with_estimator(TokenBudgetEstimator::new())
    }

    pub fn with_estimator(estimator: TokenBudgetEstimator) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            thread_id: Uuid::new_v4().to_string(),
            turns: Vec::new(),
            summary: None,
            estimator,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current remote thread handle
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Start a fresh remote context window
    pub fn renew_thread(&mut self) -> &str {
        self.thread_id = Uuid::new_v4().to_string();
        &self.thread_id
    }

    pub fn estimator(&self) -> &TokenBudgetEstimator {
        &self.estimator
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.summary.is_none()
    }

    /// Add a turn to the end
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Estimated size of the summary plus every retained turn
    pub fn total_size(&self) -> usize {
        let summary_size = self
            .summary
            .as_deref()
            .map(|s| self.estimator.estimate(s))
            .unwrap_or(0);
        summary_size + self.turns.iter().map(Turn::size).sum::<usize>()
    }

    /// Copy of `turn` cut to `max_size` units, marker included.
    ///
    /// Turns already within the limit are returned unchanged.
    pub fn truncate_turn(&self, turn: &Turn, max_size: usize) -> Turn {
        if turn.size() <= max_size {
            return turn.clone();
        }

        let marker_chars = TRUNCATION_MARKER.chars().count();
        let keep = self
            .estimator
            .chars_for(max_size)
            .saturating_sub(marker_chars);
        let mut content = truncate_chars(turn.content(), keep).trim_end().to_string();
        content.push_str(TRUNCATION_MARKER);

        turn.with_content(content, &self.estimator)
    }

    /// Replace the history with a summary.
    ///
    /// Keeps only the most recent turn when `keep_last` is set, nothing
    /// otherwise. The summary is capped at [`SUMMARY_MAX_CHARS`].
    pub fn compact(&mut self, new_summary: impl Into<String>, keep_last: bool) {
        let retained = if keep_last { self.turns.pop() } else { None };
        self.turns.clear();
        self.turns.extend(retained);

        let summary = new_summary.into();
        self.summary = Some(truncate_chars(&summary, SUMMARY_MAX_CHARS).to_string());
    }

    /// Drop the oldest retained turn, returning it
    pub(crate) fn drop_oldest(&mut self) -> Option<Turn> {
        if self.turns.is_empty() {
            None
        } else {
            Some(self.turns.remove(0))
        }
    }

    /// Shrink the summary to at most `max_units`
    pub(crate) fn cap_summary(&mut self, max_units: usize) {
        let max_chars = self.estimator.chars_for(max_units);
        if let Some(summary) = self.summary.as_mut() {
            let capped = truncate_chars(summary, max_chars).len();
            summary.truncate(capped);
        }
    }

    /// Clear summary and history
    pub fn reset(&mut self) {
        self.turns.clear();
        self.summary = None;
    }

    /// Outbound message list: instructions, summary, then turns in order
    pub fn to_messages(&self, system_prompt: Option<&str>) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.turns.len() + 2);

        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            messages.push(Message::system(prompt));
        }

        if let Some(summary) = &self.summary {
            messages.push(Message::system(format!("{SUMMARY_PREFIX}{summary}")));
        }

        messages.extend(self.turns.iter().map(Turn::to_message));
        messages
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}
