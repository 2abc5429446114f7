/// Modality register persistence
///
/// One row per subject recording the channel it was last active on.
/// Writes are last-write-wins.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use sdk::types::{Channel, ModalityEntry};

use super::{from_millis, to_millis};

/// Modality repository for database operations
#[derive(Clone)]
pub struct ModalityRepository {
    pool: SqlitePool,
}

impl ModalityRepository {
    /// Create a new modality repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Overwrite the subject's entry with a new channel and timestamp
    pub async fn upsert(&self, subject_id: &str, channel: Channel, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO modality_entries (subject_id, channel, last_active_at) VALUES (?, ?, ?) \
             ON CONFLICT(subject_id) DO UPDATE SET \
             channel = excluded.channel, last_active_at = excluded.last_active_at",
        )
        .bind(subject_id)
        .bind(channel.as_str())
        .bind(to_millis(at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert modality entry")?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh `last_active_at` without changing the channel
    pub async fn touch(&self, subject_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE modality_entries SET last_active_at = ? WHERE subject_id = ?")
            .bind(to_millis(at))
            .bind(subject_id)
            .execute(&self.pool)
            .await
            .context("Failed to touch modality entry")?;

        Ok(result.rows_affected() > 0)
    }

    /// Get the subject's entry
    pub async fn get(&self, subject_id: &str) -> Result<Option<ModalityEntry>> {
        let row = sqlx::query(
            "SELECT subject_id, channel, last_active_at FROM modality_entries WHERE subject_id = ?",
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch modality entry")?;

        row.map(|r| -> Result<ModalityEntry> {
            Ok(ModalityEntry {
                subject_id: r.try_get("subject_id")?,
                channel: r.try_get::<String, _>("channel")?.parse()?,
                last_active_at: from_millis(r.try_get("last_active_at")?)?,
            })
        })
        .transpose()
    }
}
