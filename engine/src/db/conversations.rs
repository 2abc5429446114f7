/// Conversation persistence operations
///
/// Conversation states, compaction audit records and subject identity links.
/// The context window is stored as a JSON document; timestamps are stored as
/// milliseconds since the Unix epoch. All queries are parameterized.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use sdk::types::{Channel, ContextWindow, ConversationState, StateId, StateUpdate, SummaryRecord};

use super::{from_millis, to_millis};

const STATE_COLUMNS: &str = "id, subject_id, channel, context_window, turn_count, is_active, \
     last_compacted_at, created_at, updated_at";

/// Conversation repository for database operations
#[derive(Clone)]
pub struct ConversationRepository {
    pool: SqlitePool,
}

impl ConversationRepository {
    /// Create a new conversation repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recently created active state for (subject, channel)
    pub async fn find_latest_active(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> Result<Option<ConversationState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversation_states \
             WHERE subject_id = ? AND channel = ? AND is_active = 1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            STATE_COLUMNS
        ))
        .bind(subject_id)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest conversation state")?;

        row.as_ref().map(state_from_row).transpose()
    }

    /// Get a state by ID
    pub async fn get_state(&self, id: StateId) -> Result<Option<ConversationState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conversation_states WHERE id = ?",
            STATE_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch conversation state")?;

        row.as_ref().map(state_from_row).transpose()
    }

    /// States for a subject, newest first
    pub async fn list_states(
        &self,
        subject_id: &str,
        channel: Option<Channel>,
        limit: i64,
    ) -> Result<Vec<ConversationState>> {
        let rows = match channel {
            Some(channel) => {
                sqlx::query(&format!(
                    "SELECT {} FROM conversation_states WHERE subject_id = ? AND channel = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    STATE_COLUMNS
                ))
                .bind(subject_id)
                .bind(channel.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM conversation_states WHERE subject_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                    STATE_COLUMNS
                ))
                .bind(subject_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list conversation states")?;

        rows.iter().map(state_from_row).collect()
    }

    /// Insert a new active state with no turns counted yet
    pub async fn create_state(
        &self,
        subject_id: &str,
        channel: Channel,
        window: &ContextWindow,
        created_at: DateTime<Utc>,
    ) -> Result<ConversationState> {
        let window_json =
            serde_json::to_string(window).context("Failed to serialize context window")?;
        let at = to_millis(created_at);

        let result = sqlx::query(
            "INSERT INTO conversation_states \
             (subject_id, channel, context_window, turn_count, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, 0, 1, ?, ?)",
        )
        .bind(subject_id)
        .bind(channel.as_str())
        .bind(&window_json)
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to create conversation state")?;

        Ok(ConversationState {
            id: StateId(result.last_insert_rowid()),
            subject_id: subject_id.to_string(),
            channel,
            context_window: window.clone(),
            turn_count: 0,
            is_active: true,
            last_compacted_at: None,
            created_at,
            updated_at: created_at,
        })
    }

    /// Write back an appended turn
    ///
    /// The `turn_count <= ?` guard refuses writes that would move the counter
    /// backwards. Returns whether a row was changed.
    pub async fn update_state(&self, id: StateId, update: &StateUpdate) -> Result<bool> {
        let window_json = serde_json::to_string(&update.context_window)
            .context("Failed to serialize context window")?;
        let turn_count = i64::try_from(update.turn_count).context("Turn count out of range")?;

        let result = sqlx::query(
            "UPDATE conversation_states \
             SET context_window = ?, turn_count = ?, last_compacted_at = ?, updated_at = ? \
             WHERE id = ? AND turn_count <= ?",
        )
        .bind(&window_json)
        .bind(turn_count)
        .bind(update.last_compacted_at.map(to_millis))
        .bind(to_millis(update.updated_at))
        .bind(id.0)
        .bind(turn_count)
        .execute(&self.pool)
        .await
        .context("Failed to update conversation state")?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark a state inactive
    pub async fn close_state(&self, id: StateId) -> Result<bool> {
        let result =
            sqlx::query("UPDATE conversation_states SET is_active = 0 WHERE id = ? AND is_active = 1")
                .bind(id.0)
                .execute(&self.pool)
                .await
                .context("Failed to close conversation state")?;

        Ok(result.rows_affected() > 0)
    }

    /// Append a compaction audit record
    pub async fn insert_summary_record(&self, record: &SummaryRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO summary_records \
             (state_id, subject_id, channel, summary_text, turns_covered, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.state_id.0)
        .bind(&record.subject_id)
        .bind(record.channel.as_str())
        .bind(&record.summary_text)
        .bind(i64::from(record.turns_covered))
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert summary record")?;

        Ok(result.rows_affected() > 0)
    }

    /// Audit records for (subject, channel), oldest first
    pub async fn list_summary_records(
        &self,
        subject_id: &str,
        channel: Channel,
    ) -> Result<Vec<SummaryRecord>> {
        let rows = sqlx::query(
            "SELECT state_id, subject_id, channel, summary_text, turns_covered, created_at \
             FROM summary_records WHERE subject_id = ? AND channel = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(subject_id)
        .bind(channel.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list summary records")?;

        rows.iter()
            .map(|r| -> Result<SummaryRecord> {
                let turns_covered: i64 = r.try_get("turns_covered")?;
                Ok(SummaryRecord {
                    state_id: StateId(r.try_get("state_id")?),
                    subject_id: r.try_get("subject_id")?,
                    channel: r.try_get::<String, _>("channel")?.parse()?,
                    summary_text: r.try_get("summary_text")?,
                    turns_covered: u32::try_from(turns_covered)
                        .context("Stored turns_covered out of range")?,
                    created_at: from_millis(r.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    /// Record that a subject has been seen on a channel
    ///
    /// Creates the link on first sight and refreshes `last_seen_at` afterwards.
    pub async fn ensure_subject_link(
        &self,
        subject_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let at = to_millis(at);

        sqlx::query(
            "INSERT INTO subject_links (subject_id, channel, linked_at, last_seen_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(subject_id, channel) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        )
        .bind(subject_id)
        .bind(channel.as_str())
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert subject link")?;

        Ok(())
    }
}

fn state_from_row(r: &SqliteRow) -> Result<ConversationState> {
    let id: i64 = r.try_get("id")?;
    let window_json: String = r.try_get("context_window")?;
    let context_window: ContextWindow = serde_json::from_str(&window_json)
        .with_context(|| format!("Corrupt context window in state {}", id))?;
    let turn_count: i64 = r.try_get("turn_count")?;
    let last_compacted_at: Option<i64> = r.try_get("last_compacted_at")?;

    Ok(ConversationState {
        id: StateId(id),
        subject_id: r.try_get("subject_id")?,
        channel: r.try_get::<String, _>("channel")?.parse()?,
        context_window,
        turn_count: u64::try_from(turn_count).context("Stored turn_count is negative")?,
        is_active: r.try_get::<i64, _>("is_active")? != 0,
        last_compacted_at: last_compacted_at.map(from_millis).transpose()?,
        created_at: from_millis(r.try_get("created_at")?)?,
        updated_at: from_millis(r.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::TimeZone;
    use sdk::types::Turn;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_740_820_000 + secs, 0).unwrap()
    }

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_create_and_find_latest() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();

        let created = repo
            .create_state("u1", Channel::Web, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();
        assert!(created.id.0 > 0);
        assert_eq!(created.turn_count, 0);

        let found = repo.find_latest_active("u1", Channel::Web).await.unwrap().unwrap();
        assert_eq!(found, created);

        assert!(repo.find_latest_active("u1", Channel::Voice).await.unwrap().is_none());
        assert!(repo.find_latest_active("u2", Channel::Web).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_prefers_newest_created() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();

        repo.create_state("u1", Channel::Web, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();
        let newer = repo
            .create_state("u1", Channel::Web, &ContextWindow::empty(at(90_000)), at(90_000))
            .await
            .unwrap();

        let found = repo.find_latest_active("u1", Channel::Web).await.unwrap().unwrap();
        assert_eq!(found.id, newer.id);
    }

    #[tokio::test]
    async fn test_update_roundtrips_window() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();
        let state = repo
            .create_state("u1", Channel::Telegram, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();

        let mut window = state.context_window.clone();
        window.append_summary("earlier talk");
        window.push_turn(Turn::new(sdk::types::Role::User, "hi", at(5)), at(5));

        let update = StateUpdate {
            context_window: window.clone(),
            turn_count: 3,
            last_compacted_at: Some(at(5)),
            updated_at: at(5),
        };
        assert!(repo.update_state(state.id, &update).await.unwrap());

        let loaded = repo.get_state(state.id).await.unwrap().unwrap();
        assert_eq!(loaded.context_window, window);
        assert_eq!(loaded.turn_count, 3);
        assert_eq!(loaded.last_compacted_at, Some(at(5)));
        assert_eq!(loaded.updated_at, at(5));
        assert_eq!(loaded.created_at, at(0));
    }

    #[tokio::test]
    async fn test_update_refuses_lower_turn_count() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();
        let state = repo
            .create_state("u1", Channel::Web, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();

        let update = |n| StateUpdate {
            context_window: ContextWindow::empty(at(1)),
            turn_count: n,
            last_compacted_at: None,
            updated_at: at(1),
        };

        assert!(repo.update_state(state.id, &update(4)).await.unwrap());
        assert!(!repo.update_state(state.id, &update(2)).await.unwrap());
        assert!(!repo.update_state(StateId(9999), &update(5)).await.unwrap());

        let loaded = repo.get_state(state.id).await.unwrap().unwrap();
        assert_eq!(loaded.turn_count, 4);
    }

    #[tokio::test]
    async fn test_close_hides_state_from_latest() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();
        let state = repo
            .create_state("u1", Channel::Web, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();

        assert!(repo.close_state(state.id).await.unwrap());
        assert!(!repo.close_state(state.id).await.unwrap());
        assert!(repo.find_latest_active("u1", Channel::Web).await.unwrap().is_none());

        // Closed states stay readable by id
        let frozen = repo.get_state(state.id).await.unwrap().unwrap();
        assert!(!frozen.is_active);
    }

    #[tokio::test]
    async fn test_list_states_filters_and_orders() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();
        for (i, channel) in [Channel::Web, Channel::Voice, Channel::Web].iter().enumerate() {
            let t = at(i as i64 * 100);
            repo.create_state("u1", *channel, &ContextWindow::empty(t), t)
                .await
                .unwrap();
        }

        let all = repo.list_states("u1", None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let web = repo.list_states("u1", Some(Channel::Web), 10).await.unwrap();
        assert_eq!(web.len(), 2);

        let limited = repo.list_states("u1", None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].created_at, at(200));
    }

    #[tokio::test]
    async fn test_summary_records_in_order() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();
        let state = repo
            .create_state("u1", Channel::Slack, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();

        for (i, text) in ["first", "second"].iter().enumerate() {
            let record = SummaryRecord {
                state_id: state.id,
                subject_id: "u1".to_string(),
                channel: Channel::Slack,
                summary_text: text.to_string(),
                turns_covered: 4,
                created_at: at(i as i64 + 1),
            };
            assert!(repo.insert_summary_record(&record).await.unwrap());
        }

        let records = repo.list_summary_records("u1", Channel::Slack).await.unwrap();
        let texts: Vec<&str> = records.iter().map(|r| r.summary_text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_summary_record_requires_existing_state() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();

        let record = SummaryRecord {
            state_id: StateId(42),
            subject_id: "u1".to_string(),
            channel: Channel::Web,
            summary_text: "orphan".to_string(),
            turns_covered: 1,
            created_at: at(0),
        };
        assert!(repo.insert_summary_record(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_subject_link_upsert() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();

        repo.ensure_subject_link("u1", Channel::Web, at(0)).await.unwrap();
        repo.ensure_subject_link("u1", Channel::Web, at(60)).await.unwrap();

        let (linked_at, last_seen_at): (i64, i64) = sqlx::query_as(
            "SELECT linked_at, last_seen_at FROM subject_links WHERE subject_id = ? AND channel = ?",
        )
        .bind("u1")
        .bind("web")
        .fetch_one(db.pool())
        .await
        .unwrap();

        assert_eq!(linked_at, to_millis(at(0)));
        assert_eq!(last_seen_at, to_millis(at(60)));
    }

    #[tokio::test]
    async fn test_corrupt_window_is_an_error() {
        let (_dir, db) = setup().await;
        let repo = db.conversations();
        let state = repo
            .create_state("u1", Channel::Web, &ContextWindow::empty(at(0)), at(0))
            .await
            .unwrap();

        sqlx::query("UPDATE conversation_states SET context_window = 'not json' WHERE id = ?")
            .bind(state.id.0)
            .execute(db.pool())
            .await
            .unwrap();

        let err = repo.get_state(state.id).await.unwrap_err();
        assert!(err.downcast_ref::<serde_json::Error>().is_some());
    }
}
