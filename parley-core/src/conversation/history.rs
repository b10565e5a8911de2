//! Conversation turns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::estimator::TokenBudgetEstimator;
use crate::llm::Message;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::User => f.write_str("User"),
            TurnRole::Assistant => f.write_str("Assistant"),
        }
    }
}

/// One message in the chronological record.
///
/// Turns are immutable once built; the estimated size is computed at
/// construction and travels with the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    role: TurnRole,
    content: String,
    size: usize,
    created_at: DateTime<Utc>,
}

impl Turn {
    /// Create a turn, estimating its size with `estimator`
    pub fn new(role: TurnRole, content: impl Into<String>, estimator: &TokenBudgetEstimator) -> Self {
        let content = content.into();
        Self {
            role,
            size: estimator.estimate(&content),
            content,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>, estimator: &TokenBudgetEstimator) -> Self {
        Self::new(TurnRole::User, content, estimator)
    }

    pub fn assistant(content: impl Into<String>, estimator: &TokenBudgetEstimator) -> Self {
        Self::new(TurnRole::Assistant, content, estimator)
    }

    pub fn role(&self) -> TurnRole {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Estimated size in budget units
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Copy with different content, keeping role and timestamp
    pub(crate) fn with_content(&self, content: String, estimator: &TokenBudgetEstimator) -> Self {
        Self {
            role: self.role,
            size: estimator.estimate(&content),
            content,
            created_at: self.created_at,
        }
    }

    /// Convert to an outbound message
    pub fn to_message(&self) -> Message {
        match self.role {
            TurnRole::User => Message::user(self.content.clone()),
            TurnRole::Assistant => Message::assistant(self.content.clone()),
        }
    }
}
