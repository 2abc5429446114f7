//! SQLite-backed persistence gateway
//!
//! Adapts [`ConversationRepository`] and [`ModalityRepository`] to the
//! [`PersistenceGateway`] contract. Repository errors are `anyhow` chains;
//! here they are flattened into [`StoreError`] values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sdk::errors::{EngineError, StoreError};
use sdk::gateway::{PersistenceGateway, StoreResult};
use sdk::types::{
    Channel, ContextWindow, ConversationState, ModalityEntry, StateId, StateUpdate, SummaryRecord,
};

use super::{ConversationRepository, ModalityRepository};

/// [`PersistenceGateway`] over the SQLite repositories
#[derive(Clone)]
pub struct SqliteGateway {
    conversations: ConversationRepository,
    modality: ModalityRepository,
}

impl SqliteGateway {
    pub fn new(conversations: ConversationRepository, modality: ModalityRepository) -> Self {
        Self {
            conversations,
            modality,
        }
    }
}

/// Rows that fail to decode are reported as corrupt; everything else is a
/// backend failure.
fn store_error(err: anyhow::Error) -> StoreError {
    let corrupt = err.downcast_ref::<serde_json::Error>().is_some()
        || matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownChannel(_))
        );

    if corrupt {
        StoreError::Corrupt(format!("{:#}", err))
    } else {
        StoreError::Backend(format!("{:#}", err))
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn find_latest_state(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> StoreResult<Option<ConversationState>> {
        self.conversations
            .find_latest_active(subject_id, channel)
            .await
            .map_err(store_error)
    }

    async fn find_state(&self, id: StateId) -> StoreResult<Option<ConversationState>> {
        self.conversations.get_state(id).await.map_err(store_error)
    }

    async fn list_states(
        &self,
        subject_id: &str,
        channel: Option<Channel>,
        limit: usize,
    ) -> StoreResult<Vec<ConversationState>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.conversations
            .list_states(subject_id, channel, limit)
            .await
            .map_err(store_error)
    }

    async fn create_state(
        &self,
        subject_id: &str,
        channel: Channel,
        window: &ContextWindow,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ConversationState> {
        self.conversations
            .create_state(subject_id, channel, window, created_at)
            .await
            .map_err(store_error)
    }

    async fn update_state(&self, id: StateId, update: &StateUpdate) -> StoreResult<bool> {
        self.conversations
            .update_state(id, update)
            .await
            .map_err(store_error)
    }

    async fn close_state(&self, id: StateId) -> StoreResult<bool> {
        self.conversations.close_state(id).await.map_err(store_error)
    }

    async fn append_summary_record(&self, record: &SummaryRecord) -> StoreResult<bool> {
        self.conversations
            .insert_summary_record(record)
            .await
            .map_err(store_error)
    }

    async fn list_summary_records(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> StoreResult<Vec<SummaryRecord>> {
        self.conversations
            .list_summary_records(subject_id, channel)
            .await
            .map_err(store_error)
    }

    async fn ensure_subject_link(
        &self,
        subject_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.conversations
            .ensure_subject_link(subject_id, channel, at)
            .await
            .map_err(store_error)
    }

    async fn upsert_modality(
        &self,
        subject_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.modality
            .upsert(subject_id, channel, at)
            .await
            .map_err(store_error)
    }

    async fn touch_modality(&self, subject_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.modality.touch(subject_id, at).await.map_err(store_error)
    }

    async fn get_modality(&self, subject_id: &str) -> StoreResult<Option<ModalityEntry>> {
        self.modality.get(subject_id).await.map_err(store_error)
    }
}
