//! Compaction policy
//!
//! Decides when the unsummarized turns of a context window have grown too
//! large and where to cut them. The size is measured in characters of turn
//! content, not in turn count, so a handful of very long turns still trigger
//! compaction. The most recent `retention_floor` turns are never summarized.

use sdk::types::{ContextWindow, Turn};

/// Default number of most-recent turns always kept verbatim
pub const DEFAULT_RETENTION_FLOOR: usize = 2;

/// Default character budget for unsummarized turns
pub const DEFAULT_SIZE_THRESHOLD: usize = 6000;

/// Outcome of one compaction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The window was within budget
    NotDue,

    /// A prefix of turns was folded into the summary
    Compacted { summary: String, turns_covered: usize },

    /// Compaction was due but the summarizer failed; the window is untouched
    Skipped { reason: String },
}

impl CompactionOutcome {
    pub fn is_compacted(&self) -> bool {
        matches!(self, CompactionOutcome::Compacted { .. })
    }
}

/// Size threshold and retention floor for compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    size_threshold: usize,
    retention_floor: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_THRESHOLD, DEFAULT_RETENTION_FLOOR)
    }
}

impl CompactionPolicy {
    pub fn new(size_threshold: usize, retention_floor: usize) -> Self {
        Self {
            size_threshold,
            retention_floor,
        }
    }

    pub fn size_threshold(&self) -> usize {
        self.size_threshold
    }

    pub fn retention_floor(&self) -> usize {
        self.retention_floor
    }

    /// True when the turns exceed the size threshold and there is something
    /// older than the retention floor to summarize
    pub fn should_compact(&self, window: &ContextWindow) -> bool {
        window.char_len() > self.size_threshold && window.turns.len() > self.retention_floor
    }

    /// Index of the first turn that is kept verbatim
    pub fn split_point(&self, window: &ContextWindow) -> usize {
        window.turns.len().saturating_sub(self.retention_floor)
    }

    /// Split turns into (to summarize, to keep), oldest first
    ///
    /// Purely positional. When the window holds no more than the retention
    /// floor the first slice is empty.
    pub fn select_for_compaction<'a>(&self, window: &'a ContextWindow) -> (&'a [Turn], &'a [Turn]) {
        window.turns.split_at(self.split_point(window))
    }
}
