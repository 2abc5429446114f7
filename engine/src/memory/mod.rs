//! Conversation memory engine
//!
//! Keeps one rolling context window per (subject, channel, calendar day) and
//! compacts old turns into a cumulative summary when the window grows past
//! the configured size. The engine is the only writer of conversation
//! states; transports call [`ConversationMemoryEngine::append_turn`] and
//! render the result with [`ConversationMemoryEngine::build_prompt`].
//!
//! # Failure handling
//!
//! Store and summarizer failures never reach the caller:
//!
//! - If the store cannot be read or written while resolving today's state,
//!   the caller gets an ephemeral context whose id is [`StateId::EPHEMERAL`].
//!   Turns appended to it are returned but not persisted.
//! - If the summarizer fails, times out or returns nothing, compaction is
//!   skipped for that turn and the window keeps every turn.
//! - Write-back failures are logged and the in-memory window is returned.
//!
//! Only invalid input (blank subject ids, blank turn content) is returned as
//! an [`EngineError`].
//!
//! # Concurrency
//!
//! All operations that read and then write a state run under a per-key lock
//! (see [`locks::KeyedLocks`]), so concurrent appends for one key are applied
//! one after another. The summarizer is called with the key's lock held, so
//! an append that triggers compaction delays later appends for the same key
//! by up to the summarizer timeout. Other keys are not affected. Appends run
//! on a spawned task and finish even if the caller stops waiting.

pub mod locks;
pub mod prompt;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use sdk::errors::{EngineError, SummarizeError};
use sdk::gateway::PersistenceGateway;
use sdk::summarizer::Summarizer;
use sdk::types::{
    Channel, ContextWindow, ConversationState, ModalityEntry, StateId, StateUpdate, SummaryRecord,
    Turn,
};

use crate::clock::{Clock, SystemClock};
use crate::compaction::{CompactionOutcome, CompactionPolicy};
use crate::config::Config;
use crate::day_window::DayWindowResolver;
use crate::db::with_deadline;
use crate::modality::{ModalityRegister, DEFAULT_PRESENCE_TTL_SECS};

use locks::KeyedLocks;
use prompt::PromptLimits;

/// Default timeout for a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a summarizer call
pub const DEFAULT_SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for [`ConversationMemoryEngine`]
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: CompactionPolicy,
    pub day_window: DayWindowResolver,
    pub store_timeout: Duration,
    pub summarizer_timeout: Duration,
    pub presence_ttl: chrono::Duration,
    pub prompt_limits: PromptLimits,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: CompactionPolicy::default(),
            day_window: DayWindowResolver::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            summarizer_timeout: DEFAULT_SUMMARIZER_TIMEOUT,
            presence_ttl: chrono::Duration::seconds(DEFAULT_PRESENCE_TTL_SECS as i64),
            prompt_limits: PromptLimits::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        Ok(Self {
            policy: config.compaction_policy(),
            day_window: config.day_window()?,
            store_timeout: config.store_timeout(),
            summarizer_timeout: config.summarizer_timeout(),
            presence_ttl: config.presence_ttl(),
            prompt_limits: config.prompt_limits(),
        })
    }
}

/// Where a context came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOrigin {
    /// Backed by a stored conversation state
    Persisted,

    /// The store was unreachable; nothing about this context is durable
    Ephemeral,
}

/// Today's context for a (subject, channel)
#[derive(Debug, Clone)]
pub struct ContextHandle {
    pub state_id: StateId,
    pub window: ContextWindow,
    pub turn_count: u64,
    pub last_compacted_at: Option<DateTime<Utc>>,
    pub origin: ContextOrigin,
}

impl ContextHandle {
    fn persisted(state: ConversationState) -> Self {
        Self {
            state_id: state.id,
            window: state.context_window,
            turn_count: state.turn_count,
            last_compacted_at: state.last_compacted_at,
            origin: ContextOrigin::Persisted,
        }
    }

    fn ephemeral(now: DateTime<Utc>) -> Self {
        Self {
            state_id: StateId::EPHEMERAL,
            window: ContextWindow::empty(now),
            turn_count: 0,
            last_compacted_at: None,
            origin: ContextOrigin::Ephemeral,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.origin == ContextOrigin::Ephemeral
    }
}

/// Everything that happened while appending one turn
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub state_id: StateId,
    pub window: ContextWindow,
    pub turn_count: u64,
    pub compaction: CompactionOutcome,

    /// Whether the updated state was written back
    pub persisted: bool,
}

struct Inner {
    gateway: Arc<dyn PersistenceGateway>,
    summarizer: Arc<dyn Summarizer>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    locks: KeyedLocks,
    modality: ModalityRegister,
}

/// Orchestrates day windows, compaction and persistence
///
/// Cheap to clone; clones share collaborators and locks.
#[derive(Clone)]
pub struct ConversationMemoryEngine {
    inner: Arc<Inner>,
}

impl ConversationMemoryEngine {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        summarizer: Arc<dyn Summarizer>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let modality = ModalityRegister::new(
            Arc::clone(&gateway),
            Arc::clone(&clock),
            settings.store_timeout,
            settings.presence_ttl,
        );

        Self {
            inner: Arc::new(Inner {
                gateway,
                summarizer,
                clock,
                settings,
                locks: KeyedLocks::new(),
                modality,
            }),
        }
    }

    /// Build an engine on the wall clock with settings taken from `config`
    pub fn from_config(
        config: &Config,
        gateway: Arc<dyn PersistenceGateway>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self, EngineError> {
        let settings = EngineSettings::from_config(config)?;
        Ok(Self::new(gateway, summarizer, Arc::new(SystemClock), settings))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// The presence register sharing this engine's store and clock
    pub fn modality(&self) -> &ModalityRegister {
        &self.inner.modality
    }

    /// Fetch today's context for (subject, channel), creating it if needed
    ///
    /// A state whose last update falls on an earlier day is left untouched
    /// and a fresh one is created next to it. When the store is unreachable
    /// the returned handle is ephemeral.
    pub async fn get_or_create_context(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> Result<ContextHandle, EngineError> {
        require_subject(subject_id)?;

        let _guard = self.inner.locks.acquire(subject_id, channel).await;
        Ok(self.inner.resolve_context(subject_id, channel).await)
    }

    /// Append a turn to today's context and return the updated window
    pub async fn append_turn(
        &self,
        subject_id: &str,
        channel: Channel,
        turn: Turn,
    ) -> Result<ContextWindow, EngineError> {
        Ok(self.append_turn_with_report(subject_id, channel, turn).await?.window)
    }

    /// Like [`append_turn`](Self::append_turn), also reporting compaction and
    /// write-back results
    pub async fn append_turn_with_report(
        &self,
        subject_id: &str,
        channel: Channel,
        turn: Turn,
    ) -> Result<TurnReport, EngineError> {
        require_subject(subject_id)?;
        if turn.content.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "turn content must not be blank".to_string(),
            ));
        }

        let inner = Arc::clone(&self.inner);
        let subject_id = subject_id.to_string();

        // Detached so that a dropped caller does not cut persistence short
        let task = tokio::spawn(async move { inner.append_locked(&subject_id, channel, turn).await });

        task.await
            .map_err(|e| EngineError::TaskAborted(e.to_string()))
    }

    /// Render a window for the agent, applying the configured display caps
    pub fn build_prompt(&self, window: &ContextWindow) -> String {
        prompt::render(window, &self.inner.settings.prompt_limits)
    }

    /// Look up a state by id, including frozen ones
    pub async fn load_state(&self, id: StateId) -> Option<ConversationState> {
        if id.is_ephemeral() {
            return None;
        }

        let inner = &self.inner;
        match with_deadline(
            inner.settings.store_timeout,
            "find_state",
            inner.gateway.find_state(id),
        )
        .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!(state_id = %id, error = %e, "Failed to load conversation state");
                None
            }
        }
    }

    /// States for a subject, newest first
    pub async fn list_states(
        &self,
        subject_id: &str,
        channel: Option<Channel>,
        limit: usize,
    ) -> Result<Vec<ConversationState>, EngineError> {
        require_subject(subject_id)?;

        let inner = &self.inner;
        match with_deadline(
            inner.settings.store_timeout,
            "list_states",
            inner.gateway.list_states(subject_id, channel, limit),
        )
        .await
        {
            Ok(states) => Ok(states),
            Err(e) => {
                warn!(subject_id, error = %e, "Failed to list conversation states");
                Ok(Vec::new())
            }
        }
    }

    /// Freeze today's state so the next turn starts a new one
    ///
    /// Returns `false` when there was nothing to close or the store refused.
    pub async fn close_active_context(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> Result<bool, EngineError> {
        require_subject(subject_id)?;

        let inner = &self.inner;
        let _guard = inner.locks.acquire(subject_id, channel).await;

        let latest = with_deadline(
            inner.settings.store_timeout,
            "find_latest_state",
            inner.gateway.find_latest_state(subject_id, channel),
        )
        .await;

        let state = match latest {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(subject_id, %channel, error = %e, "Failed to find context to close");
                return Ok(false);
            }
        };

        match with_deadline(
            inner.settings.store_timeout,
            "close_state",
            inner.gateway.close_state(state.id),
        )
        .await
        {
            Ok(closed) => {
                info!(subject_id, %channel, state_id = %state.id, closed, "Closed active context");
                Ok(closed)
            }
            Err(e) => {
                warn!(subject_id, %channel, state_id = %state.id, error = %e, "Failed to close context");
                Ok(false)
            }
        }
    }

    /// Compaction audit trail for (subject, channel), oldest first
    pub async fn summary_records(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> Result<Vec<SummaryRecord>, EngineError> {
        require_subject(subject_id)?;

        let inner = &self.inner;
        match with_deadline(
            inner.settings.store_timeout,
            "list_summary_records",
            inner.gateway.list_summary_records(subject_id, channel),
        )
        .await
        {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!(subject_id, %channel, error = %e, "Failed to list summary records");
                Ok(Vec::new())
            }
        }
    }

    /// Record `channel` as the subject's current channel
    pub async fn set_modality(&self, subject_id: &str, channel: Channel) -> Result<bool, EngineError> {
        require_subject(subject_id)?;
        Ok(self.inner.modality.set_modality(subject_id, channel).await)
    }

    /// Refresh the subject's presence without changing its channel
    pub async fn touch(&self, subject_id: &str) -> Result<bool, EngineError> {
        require_subject(subject_id)?;
        Ok(self.inner.modality.touch(subject_id).await)
    }

    pub async fn get_modality(&self, subject_id: &str) -> Result<Option<ModalityEntry>, EngineError> {
        require_subject(subject_id)?;
        Ok(self.inner.modality.get_modality(subject_id).await)
    }

    /// The subject's channel if it was active within the presence TTL
    pub async fn get_live_modality(
        &self,
        subject_id: &str,
    ) -> Result<Option<ModalityEntry>, EngineError> {
        require_subject(subject_id)?;
        Ok(self.inner.modality.get_live_modality(subject_id).await)
    }
}

impl Inner {
    /// Resolve today's context; the caller holds the key's lock
    async fn resolve_context(&self, subject_id: &str, channel: Channel) -> ContextHandle {
        let now = self.clock.now();
        let timeout = self.settings.store_timeout;

        let latest = match with_deadline(
            timeout,
            "find_latest_state",
            self.gateway.find_latest_state(subject_id, channel),
        )
        .await
        {
            Ok(latest) => latest,
            Err(e) => {
                warn!(subject_id, %channel, error = %e, "Store unreachable, using ephemeral context");
                return ContextHandle::ephemeral(now);
            }
        };

        match latest {
            Some(state) if self.settings.day_window.is_same_day(state.updated_at, now) => {
                debug!(subject_id, %channel, state_id = %state.id, "Reusing today's context");
                return ContextHandle::persisted(state);
            }
            Some(state) => {
                info!(
                    subject_id,
                    %channel,
                    state_id = %state.id,
                    last_day = %self.settings.day_window.day_key(state.updated_at),
                    "Day rolled over, starting a new context"
                );
            }
            None => {}
        }

        // Link failures do not block the conversation
        if let Err(e) = with_deadline(
            timeout,
            "ensure_subject_link",
            self.gateway.ensure_subject_link(subject_id, channel, now),
        )
        .await
        {
            warn!(subject_id, %channel, error = %e, "Channel bootstrap failed");
        }

        match with_deadline(
            timeout,
            "create_state",
            self.gateway
                .create_state(subject_id, channel, &ContextWindow::empty(now), now),
        )
        .await
        {
            Ok(state) => {
                info!(
                    subject_id,
                    %channel,
                    state_id = %state.id,
                    day = %self.settings.day_window.day_key(now),
                    "Created conversation state"
                );
                ContextHandle::persisted(state)
            }
            Err(e) => {
                warn!(subject_id, %channel, error = %e, "Failed to create state, using ephemeral context");
                ContextHandle::ephemeral(now)
            }
        }
    }

    async fn append_locked(&self, subject_id: &str, channel: Channel, turn: Turn) -> TurnReport {
        let _guard = self.locks.acquire(subject_id, channel).await;

        let mut context = self.resolve_context(subject_id, channel).await;
        let now = self.clock.now();

        context.window.push_turn(turn, now);
        let turn_count = context.turn_count + 1;

        let compaction = self.compact(&mut context.window).await;

        let mut last_compacted_at = context.last_compacted_at;
        if let CompactionOutcome::Compacted {
            summary,
            turns_covered,
        } = &compaction
        {
            last_compacted_at = Some(now);
            info!(
                subject_id,
                %channel,
                state_id = %context.state_id,
                turns_covered,
                "Compacted context window"
            );

            if !context.is_ephemeral() {
                self.record_summary(subject_id, channel, context.state_id, summary, *turns_covered, now)
                    .await;
            }
        }

        let persisted = if context.is_ephemeral() {
            debug!(subject_id, %channel, "Ephemeral context, skipping write-back");
            false
        } else {
            let update = StateUpdate {
                context_window: context.window.clone(),
                turn_count,
                last_compacted_at,
                updated_at: now,
            };
            self.write_back(subject_id, channel, context.state_id, &update).await
        };

        TurnReport {
            state_id: context.state_id,
            window: context.window,
            turn_count,
            compaction,
            persisted,
        }
    }

    /// Fold the turns older than the retention floor into the summary
    ///
    /// On any summarizer failure the window is left exactly as it was.
    async fn compact(&self, window: &mut ContextWindow) -> CompactionOutcome {
        let policy = &self.settings.policy;
        if !policy.should_compact(window) {
            return CompactionOutcome::NotDue;
        }

        let (older, _) = policy.select_for_compaction(window);
        let turns_covered = older.len();

        let result = match tokio::time::timeout(
            self.settings.summarizer_timeout,
            self.summarizer.summarize(older),
        )
        .await
        {
            Ok(Ok(text)) if text.trim().is_empty() => Err(SummarizeError::Empty),
            Ok(result) => result,
            Err(_) => Err(SummarizeError::Timeout),
        };

        match result {
            Ok(summary) => {
                window.append_summary(&summary);
                window.turns.drain(..turns_covered);
                CompactionOutcome::Compacted {
                    summary,
                    turns_covered,
                }
            }
            Err(e) => {
                warn!(
                    summarizer = self.summarizer.name(),
                    error = %e,
                    "Skipping compaction"
                );
                CompactionOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn record_summary(
        &self,
        subject_id: &str,
        channel: Channel,
        state_id: StateId,
        summary: &str,
        turns_covered: usize,
        now: DateTime<Utc>,
    ) {
        let record = SummaryRecord {
            state_id,
            subject_id: subject_id.to_string(),
            channel,
            summary_text: summary.to_string(),
            turns_covered: u32::try_from(turns_covered).unwrap_or(u32::MAX),
            created_at: now,
        };

        match with_deadline(
            self.settings.store_timeout,
            "append_summary_record",
            self.gateway.append_summary_record(&record),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => warn!(state_id = %state_id, "Summary record was not stored"),
            Err(e) => warn!(state_id = %state_id, error = %e, "Failed to store summary record"),
        }
    }

    async fn write_back(
        &self,
        subject_id: &str,
        channel: Channel,
        state_id: StateId,
        update: &StateUpdate,
    ) -> bool {
        match with_deadline(
            self.settings.store_timeout,
            "update_state",
            self.gateway.update_state(state_id, update),
        )
        .await
        {
            Ok(true) => {
                debug!(subject_id, %channel, state_id = %state_id, turn_count = update.turn_count, "Persisted turn");
                true
            }
            Ok(false) => {
                warn!(subject_id, %channel, state_id = %state_id, "Store rejected state update");
                false
            }
            Err(e) => {
                warn!(subject_id, %channel, state_id = %state_id, error = %e, "Failed to persist turn");
                false
            }
        }
    }
}

fn require_subject(subject_id: &str) -> Result<(), EngineError> {
    if subject_id.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "subject id must not be blank".to_string(),
        ));
    }
    Ok(())
}
