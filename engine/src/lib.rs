//! Recall Engine Library
//!
//! Conversational memory for an AI assistant: one rolling context window per
//! subject, channel and calendar day, compacted into a cumulative summary as
//! it grows. Transports feed turns through
//! [`ConversationMemoryEngine::append_turn`] and render prompts with
//! [`ConversationMemoryEngine::build_prompt`].

/// Time source
pub mod clock;

/// Compaction policy
pub mod compaction;

/// Configuration management module
pub mod config;

/// Calendar-day resolution
pub mod day_window;

/// Database persistence module
pub mod db;

/// Conversation memory engine
pub mod memory;

/// Modality register
pub mod modality;

/// Telemetry and Observability
pub mod telemetry;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use compaction::{CompactionOutcome, CompactionPolicy};
pub use config::Config;
pub use day_window::DayWindowResolver;
pub use db::{Database, InMemoryGateway, SqliteGateway};
pub use memory::prompt::{build_prompt, PromptLimits};
pub use memory::{
    ContextHandle, ContextOrigin, ConversationMemoryEngine, EngineSettings, TurnReport,
};
pub use modality::ModalityRegister;
