//! Recall SDK
//!
//! Shared data model, collaborator traits and error types for the Recall
//! conversational memory engine. Transport adapters, summarizer
//! implementations and storage backends depend on this crate only.

/// Error types and handling
pub mod errors;

/// Persistence gateway trait
pub mod gateway;

/// Summarizer trait and transcript helper
pub mod summarizer;

/// Conversation data model
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, RecallErrorExt, StoreError, SummarizeError};
pub use gateway::{PersistenceGateway, StoreResult};
pub use summarizer::{transcript, Summarizer};
pub use types::{
    Channel, ContextWindow, ConversationState, ModalityEntry, Role, StateId, StateUpdate,
    SummaryRecord, Turn, SUMMARY_SEPARATOR,
};
