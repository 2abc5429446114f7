//! Conversation data model
//!
//! These are the values that flow between the memory engine, its persistence
//! gateway and its summarizer. They carry no behavior beyond the few
//! invariant-preserving mutators on [`ContextWindow`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::EngineError;

/// Separator placed between successive compaction summaries
pub const SUMMARY_SEPARATOR: &str = "\n\n";

/// Role of the author of a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human subject
    User,

    /// The AI agent
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Communication surface a subject is talking through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Web,
    Voice,
    Telegram,
    WhatsApp,
    Slack,
    Api,
}

impl Channel {
    /// All known channels, in declaration order
    pub const ALL: [Channel; 6] = [
        Channel::Web,
        Channel::Voice,
        Channel::Telegram,
        Channel::WhatsApp,
        Channel::Slack,
        Channel::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Voice => "voice",
            Channel::Telegram => "telegram",
            Channel::WhatsApp => "whatsapp",
            Channel::Slack => "slack",
            Channel::Api => "api",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| EngineError::UnknownChannel(s.to_string()))
    }
}

/// Identifier of a persisted conversation state
///
/// [`StateId::EPHEMERAL`] marks a context that was never written to the store;
/// callers holding it must not assume the conversation will survive a restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StateId(pub i64);

impl StateId {
    pub const EPHEMERAL: StateId = StateId(-1);

    pub fn is_ephemeral(&self) -> bool {
        *self == Self::EPHEMERAL
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message in a conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }

    /// Create a user turn stamped with the current time
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, Utc::now())
    }

    /// Create an assistant turn stamped with the current time
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, Utc::now())
    }

    /// Length of the content in characters (not bytes)
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

/// The bounded slice of a conversation used to ground the next reply
///
/// `turns` holds only turns that have not been summarized yet. `summary`
/// holds every compacted prefix in chronological order and is only ever
/// extended, see [`ContextWindow::append_summary`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextWindow {
    pub turns: Vec<Turn>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty_summary"
    )]
    summary: Option<String>,

    pub last_updated: DateTime<Utc>,
}

// A stored empty summary reads back as no summary
fn non_empty_summary<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let summary = Option::<String>::deserialize(deserializer)?;
    Ok(summary.filter(|s| !s.is_empty()))
}

impl ContextWindow {
    /// Create an empty window
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            turns: Vec::new(),
            summary: None,
            last_updated: now,
        }
    }

    /// Create a window with an existing summary and turns
    pub fn with_parts(turns: Vec<Turn>, summary: Option<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            turns,
            summary: summary.filter(|s| !s.is_empty()),
            last_updated,
        }
    }

    /// Cumulative summary text, if any compaction has happened
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.summary.is_none()
    }

    /// Total character length of the unsummarized turns
    pub fn char_len(&self) -> usize {
        self.turns.iter().map(Turn::char_len).sum()
    }

    /// Append a turn and bump `last_updated`
    pub fn push_turn(&mut self, turn: Turn, now: DateTime<Utc>) {
        self.turns.push(turn);
        self.last_updated = now;
    }

    /// Extend the summary with newer text
    ///
    /// Existing text is kept verbatim and the new text is placed after
    /// [`SUMMARY_SEPARATOR`]. Empty input leaves the summary untouched.
    pub fn append_summary(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        match self.summary.as_mut() {
            Some(existing) => {
                existing.push_str(SUMMARY_SEPARATOR);
                existing.push_str(text);
            }
            None => self.summary = Some(text.to_string()),
        }
    }
}

/// The persisted unit of conversation memory, one per (subject, channel, day)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub id: StateId,
    pub subject_id: String,
    pub channel: Channel,
    pub context_window: ContextWindow,

    /// Cumulative number of turns ever appended, summarized ones included
    pub turn_count: u64,

    /// Cleared when the state is explicitly closed
    pub is_active: bool,

    pub last_compacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written back to a state after a turn has been appended
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub context_window: ContextWindow,
    pub turn_count: u64,
    pub last_compacted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Write-once audit record of a compaction event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryRecord {
    pub state_id: StateId,
    pub subject_id: String,
    pub channel: Channel,
    pub summary_text: String,
    pub turns_covered: u32,
    pub created_at: DateTime<Utc>,
}

/// Last-write-wins presence register entry, one per subject
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModalityEntry {
    pub subject_id: String,
    pub channel: Channel,
    pub last_active_at: DateTime<Utc>,
}

impl ModalityEntry {
    /// Whether the entry has been touched within `ttl` of `now`
    pub fn is_live(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_active_at) <= ttl
    }
}
