//! Summarizer collaborator
//!
//! The memory engine does not know how summaries are produced. It hands an
//! ordered slice of turns to a [`Summarizer`] and either receives condensed
//! text or a [`SummarizeError`]. No streaming and no partial results.

use async_trait::async_trait;

use crate::errors::SummarizeError;
use crate::types::{Role, Turn};

/// Capability to condense an ordered list of turns into text
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Returns the name of the summarizer, used in logs
    fn name(&self) -> &str;

    /// Summarize `turns`, oldest first
    async fn summarize(&self, turns: &[Turn]) -> Result<String, SummarizeError>;
}

/// Render turns as a plain transcript for summarization requests
///
/// Uses bracketed labels so a completion model reads it as a record rather
/// than a conversation to continue.
pub fn transcript(turns: &[Turn]) -> String {
    let mut out = String::new();

    for turn in turns {
        let label = match turn.role {
            Role::User => "[User]: ",
            Role::Assistant => "[Assistant]: ",
        };
        out.push_str(label);
        out.push_str(&turn.content);
        out.push('\n');
    }

    out
}
