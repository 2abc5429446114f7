//! Error types and handling
//!
//! Three failure classes exist around the memory engine:
//!
//! - **Store** ([`StoreError`]): I/O against the durable store failed or timed
//!   out. The engine recovers locally (ephemeral context, log and continue).
//! - **Summarization** ([`SummarizeError`]): the external summarizer failed,
//!   timed out or produced nothing. The engine skips compaction for that cycle.
//! - **Invariant violation** ([`EngineError::InvalidInput`] and friends): the
//!   caller handed the engine something it must never accept. This is the only
//!   class that is returned to callers.
//!
//! [`EngineError`] implements [`RecallErrorExt`], which provides user-safe hints
//! and indicates whether an error is recoverable.

use thiserror::Error;

/// Trait for Recall error extensions
pub trait RecallErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and never echoes subject ids
    /// or conversation content.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    fn is_recoverable(&self) -> bool;
}

/// Failure of a persistence gateway call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable")]
    Unavailable,

    #[error("Store call timed out: {0}")]
    Timeout(&'static str),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Failure of the external summarizer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SummarizeError {
    #[error("Summarizer failed: {0}")]
    Failed(String),

    #[error("Summarizer timed out")]
    Timeout,

    #[error("Summarizer returned an empty summary")]
    Empty,
}

/// Main engine error type
///
/// Only [`EngineError::InvalidInput`], [`EngineError::UnknownChannel`],
/// [`EngineError::Config`] and [`EngineError::TaskAborted`] ever reach callers
/// of the memory engine; store and summarizer failures are wrapped here so the
/// lower layers can use `?` but are absorbed before the public API returns.
#[derive(Debug, Error)]
pub enum EngineError {
    // Invariant violations
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Collaborator errors
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Summarization(#[from] SummarizeError),

    // Runtime errors
    #[error("Background task aborted: {0}")]
    TaskAborted(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecallErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::InvalidInput(_) => "The message could not be recorded. Check that it is not empty",
            Self::UnknownChannel(_) => "This channel is not supported",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Store(_) => "Conversation history is temporarily unavailable",
            Self::Summarization(_) => "Conversation summary could not be updated",
            Self::TaskAborted(_) => "The request was interrupted. Please try again",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidInput(_) | Self::UnknownChannel(_) | Self::Config(_) => false,
            _ => true,
        }
    }
}
