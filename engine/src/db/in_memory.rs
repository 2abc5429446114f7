//! In-memory persistence gateway
//!
//! Implements the full [`PersistenceGateway`] contract over plain maps. Used by
//! tests and by embedders that do not need durability. Outages, failing
//! writes and slow stores can be simulated with
//! [`InMemoryGateway::set_available`], [`InMemoryGateway::set_writes_failing`]
//! and [`InMemoryGateway::set_latency`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use sdk::errors::StoreError;
use sdk::gateway::{PersistenceGateway, StoreResult};
use sdk::types::{
    Channel, ContextWindow, ConversationState, ModalityEntry, StateId, StateUpdate, SummaryRecord,
};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    states: HashMap<StateId, ConversationState>,
    summaries: Vec<SummaryRecord>,
    links: HashSet<(String, Channel)>,
    modality: HashMap<String, ModalityEntry>,
}

/// In-memory storage for conversation memory
#[derive(Debug)]
pub struct InMemoryGateway {
    tables: RwLock<Tables>,
    available: AtomicBool,
    writes_failing: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
            writes_failing: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }
}

impl InMemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When `false`, every call fails with [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// When `true`, reads succeed but every write fails with a backend error
    pub fn set_writes_failing(&self, failing: bool) {
        self.writes_failing.store(failing, Ordering::SeqCst);
    }

    /// Delay applied before every call
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of identity links recorded
    pub async fn link_count(&self) -> usize {
        self.tables.read().await.links.len()
    }

    async fn gate(&self) -> StoreResult<()> {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    async fn gate_write(&self) -> StoreResult<()> {
        self.gate().await?;

        if self.writes_failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("writes are failing".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn find_latest_state(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> StoreResult<Option<ConversationState>> {
        self.gate().await?;
        let tables = self.tables.read().await;

        Ok(tables
            .states
            .values()
            .filter(|s| s.is_active && s.subject_id == subject_id && s.channel == channel)
            .max_by_key(|s| (s.created_at, s.id))
            .cloned())
    }

    async fn find_state(&self, id: StateId) -> StoreResult<Option<ConversationState>> {
        self.gate().await?;
        Ok(self.tables.read().await.states.get(&id).cloned())
    }

    async fn list_states(
        &self,
        subject_id: &str,
        channel: Option<Channel>,
        limit: usize,
    ) -> StoreResult<Vec<ConversationState>> {
        self.gate().await?;
        let tables = self.tables.read().await;

        let mut states: Vec<ConversationState> = tables
            .states
            .values()
            .filter(|s| s.subject_id == subject_id && channel.map_or(true, |c| s.channel == c))
            .cloned()
            .collect();

        // Most recent first
        states.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        states.truncate(limit);
        Ok(states)
    }

    async fn create_state(
        &self,
        subject_id: &str,
        channel: Channel,
        window: &ContextWindow,
        created_at: DateTime<Utc>,
    ) -> StoreResult<ConversationState> {
        self.gate_write().await?;
        let mut tables = self.tables.write().await;

        tables.next_id += 1;
        let state = ConversationState {
            id: StateId(tables.next_id),
            subject_id: subject_id.to_string(),
            channel,
            context_window: window.clone(),
            turn_count: 0,
            is_active: true,
            last_compacted_at: None,
            created_at,
            updated_at: created_at,
        };
        tables.states.insert(state.id, state.clone());
        Ok(state)
    }

    async fn update_state(&self, id: StateId, update: &StateUpdate) -> StoreResult<bool> {
        self.gate_write().await?;
        let mut tables = self.tables.write().await;

        match tables.states.get_mut(&id) {
            Some(state) if state.turn_count <= update.turn_count => {
                state.context_window = update.context_window.clone();
                state.turn_count = update.turn_count;
                state.last_compacted_at = update.last_compacted_at;
                state.updated_at = update.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_state(&self, id: StateId) -> StoreResult<bool> {
        self.gate_write().await?;
        let mut tables = self.tables.write().await;

        match tables.states.get_mut(&id) {
            Some(state) if state.is_active => {
                state.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_summary_record(&self, record: &SummaryRecord) -> StoreResult<bool> {
        self.gate_write().await?;
        let mut tables = self.tables.write().await;

        if !tables.states.contains_key(&record.state_id) {
            return Err(StoreError::Backend(format!(
                "summary record references unknown state {}",
                record.state_id
            )));
        }
        tables.summaries.push(record.clone());
        Ok(true)
    }

    async fn list_summary_records(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> StoreResult<Vec<SummaryRecord>> {
        self.gate().await?;
        let tables = self.tables.read().await;

        // Insertion order is chronological
        Ok(tables
            .summaries
            .iter()
            .filter(|r| r.subject_id == subject_id && r.channel == channel)
            .cloned()
            .collect())
    }

    async fn ensure_subject_link(
        &self,
        subject_id: &str,
        channel: Channel,
        _at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.gate_write().await?;
        self.tables
            .write()
            .await
            .links
            .insert((subject_id.to_string(), channel));
        Ok(())
    }

    async fn upsert_modality(
        &self,
        subject_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.gate_write().await?;
        self.tables.write().await.modality.insert(
            subject_id.to_string(),
            ModalityEntry {
                subject_id: subject_id.to_string(),
                channel,
                last_active_at: at,
            },
        );
        Ok(true)
    }

    async fn touch_modality(&self, subject_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.gate_write().await?;
        let mut tables = self.tables.write().await;

        match tables.modality.get_mut(subject_id) {
            Some(entry) => {
                entry.last_active_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_modality(&self, subject_id: &str) -> StoreResult<Option<ModalityEntry>> {
        self.gate().await?;
        Ok(self.tables.read().await.modality.get(subject_id).cloned())
    }
}
