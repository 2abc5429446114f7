//! Persistence gateway collaborator
//!
//! Abstract durable storage for conversation states, compaction audit
//! records, subject identity links and the modality register. The engine owns
//! the semantics; implementations only store and fetch rows.
//!
//! Every method may fail with a [`StoreError`]. The engine never lets such a
//! failure reach its own callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::types::{
    Channel, ContextWindow, ConversationState, ModalityEntry, StateId, StateUpdate, SummaryRecord,
};

/// Result type for gateway operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage operations consumed by the memory engine
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Most recently created active state for (subject, channel)
    async fn find_latest_state(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> StoreResult<Option<ConversationState>>;

    /// Direct lookup by id, active or frozen
    async fn find_state(&self, id: StateId) -> StoreResult<Option<ConversationState>>;

    /// States for a subject, newest first, optionally restricted to one channel
    async fn list_states(
        &self,
        subject_id: &str,
        channel: Option<Channel>,
        limit: usize,
    ) -> StoreResult<Vec<ConversationState>>;

    /// Insert a new active state with `turn_count = 0`
    async fn create_state(
        &self,
        subject_id: &str,
        channel: Channel,
        window: &ContextWindow,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ConversationState>;

    /// Write back window, turn count and timestamps
    ///
    /// Returns `false` when no row was changed, either because the id is
    /// unknown or because the update would lower `turn_count`.
    async fn update_state(&self, id: StateId, update: &StateUpdate) -> StoreResult<bool>;

    /// Mark a state inactive; it is never deleted
    async fn close_state(&self, id: StateId) -> StoreResult<bool>;

    /// Append an immutable compaction audit record
    async fn append_summary_record(&self, record: &SummaryRecord) -> StoreResult<bool>;

    /// Audit records for (subject, channel), oldest first
    async fn list_summary_records(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> StoreResult<Vec<SummaryRecord>>;

    /// Make sure an identity link row exists for (subject, channel)
    async fn ensure_subject_link(
        &self,
        subject_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Overwrite the subject's register entry
    async fn upsert_modality(
        &self,
        subject_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Refresh `last_active_at`; `false` when the subject has no entry
    async fn touch_modality(&self, subject_id: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    async fn get_modality(&self, subject_id: &str) -> StoreResult<Option<ModalityEntry>>;
}
