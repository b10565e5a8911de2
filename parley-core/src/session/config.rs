//! Session configuration

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Placeholder in the system prompt replaced with today's date
pub const CURRENT_DATE_PLACEHOLDER: &str = "{current_date}";

/// Instructions used when none are configured
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Parley, a personal records assistant. \
You help the user keep track of documents, subscriptions and life events. \
Use the available actions to read or change records instead of guessing. \
Today's date is {current_date}.";

/// Context budget for one session, in estimator units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Hard ceiling for summary plus retained turns plus instructions
    pub max_total_size: usize,

    /// Retained turn count that forces summarization
    pub max_turns_before_summary: usize,

    /// Largest size a single stored turn may have
    pub max_turn_size: usize,

    /// Budget set aside for the system instructions
    pub reserved_instruction_size: usize,

    /// Aggressive compaction rounds after a context-too-large rejection
    pub max_escalation_rounds: usize,

    /// Characters of the user's request echoed back in the fallback reply
    pub fallback_excerpt_chars: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_size: 6000,
            max_turns_before_summary: 20,
            max_turn_size: 1000,
            reserved_instruction_size: 500,
            max_escalation_rounds: 2,
            fallback_excerpt_chars: 200,
        }
    }
}

impl BudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_total_size(mut self, size: usize) -> Self {
        self.max_total_size = size;
        self
    }

    pub fn with_max_turns_before_summary(mut self, turns: usize) -> Self {
        self.max_turns_before_summary = turns;
        self
    }

    pub fn with_max_turn_size(mut self, size: usize) -> Self {
        self.max_turn_size = size;
        self
    }

    pub fn with_reserved_instruction_size(mut self, size: usize) -> Self {
        self.reserved_instruction_size = size;
        self
    }

    pub fn with_max_escalation_rounds(mut self, rounds: usize) -> Self {
        self.max_escalation_rounds = rounds;
        self
    }

    pub fn with_fallback_excerpt_chars(mut self, chars: usize) -> Self {
        self.fallback_excerpt_chars = chars;
        self
    }

    /// Budget left for summary and turns once instructions are accounted for
    pub fn history_budget(&self) -> usize {
        self.max_total_size
            .saturating_sub(self.reserved_instruction_size)
    }

    /// Validate the budget
    pub fn validate(&self) -> Result<()> {
        if self.max_total_size == 0 {
            return Err(ParleyError::Configuration(
                "budget.max_total_size must be greater than zero".to_string(),
            ));
        }
        if self.reserved_instruction_size >= self.max_total_size {
            return Err(ParleyError::Configuration(format!(
                "budget.reserved_instruction_size ({}) must be below max_total_size ({})",
                self.reserved_instruction_size, self.max_total_size
            )));
        }
        if self.max_turn_size == 0 {
            return Err(ParleyError::Configuration(
                "budget.max_turn_size must be greater than zero".to_string(),
            ));
        }
        if self.max_turns_before_summary == 0 {
            return Err(ParleyError::Configuration(
                "budget.max_turns_before_summary must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-session behaviour outside the budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed instructions; `{current_date}` is substituted on use
    pub system_prompt: String,

    /// Completion rounds allowed to request actions within one exchange
    pub max_tool_rounds: usize,

    /// Sampling temperature for exchanges
    pub temperature: Option<f32>,

    /// Output ceiling for exchanges
    pub max_tokens: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tool_rounds: 8,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl SessionConfig {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    /// System prompt with today's date filled in
    pub fn render_system_prompt(&self) -> String {
        let today = Local::now().format("%Y-%m-%d").to_string();
        self.system_prompt
            .replace(CURRENT_DATE_PLACEHOLDER, &today)
    }
}
