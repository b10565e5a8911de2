//! Approximate context-size estimation

/// Characters per budget unit.
///
/// English prose averages roughly four characters per model token, so one
/// unit stands in for one token without calling a tokenizer.
pub const CHARS_PER_UNIT: usize = 4;

/// Maps text to an approximate budget unit count.
///
/// The estimate is `ceil(chars / ratio)`: zero for empty text and
/// monotonically non-decreasing in the character count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudgetEstimator {
    chars_per_unit: usize,
}

impl TokenBudgetEstimator {
    /// Estimator using [`CHARS_PER_UNIT`]
    pub const fn new() -> Self {
        Self {
            chars_per_unit: CHARS_PER_UNIT,
        }
    }

    /// Estimator with a custom ratio (clamped to at least 1)
    pub fn with_ratio(chars_per_unit: usize) -> Self {
        Self {
            chars_per_unit: chars_per_unit.max(1),
        }
    }

    pub fn chars_per_unit(&self) -> usize {
        self.chars_per_unit
    }

    /// Estimate the size of `text` in budget units
    pub fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_unit)
    }

    /// Number of characters that fit in `units`
    pub fn chars_for(&self, units: usize) -> usize {
        units.saturating_mul(self.chars_per_unit)
    }
}

impl Default for TokenBudgetEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
