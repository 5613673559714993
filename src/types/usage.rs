//! Token usage tracking.

use serde::{Deserialize, Serialize};

/// Cache token counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub read: u64,
    pub write: u64,
}

/// Token usage for a step or a whole assistant message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheUsage,
}

impl TokenUsage {
    /// Merge another usage into this one (accumulate).
    ///
    /// `total` is summed when both sides report it; otherwise whichever side
    /// has a value wins.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.cache.read += other.cache.read;
        self.cache.write += other.cache.write;
        self.total = match (self.total, other.total) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }

    /// Reported total, or the sum of the individual counters.
    pub fn effective_total(&self) -> u64 {
        self.total.unwrap_or(
            self.input + self.output + self.reasoning + self.cache.read + self.cache.write,
        )
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
