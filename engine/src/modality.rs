//! Modality register
//!
//! Tracks, per subject, the channel it is currently active on. Writes are
//! last-write-wins: a subject active on two channels at once is recorded on
//! whichever wrote last. Store failures never reach the caller.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

use sdk::gateway::PersistenceGateway;
use sdk::types::{Channel, ModalityEntry};

use crate::clock::Clock;
use crate::db::with_deadline;

/// Default liveness window for [`ModalityRegister::get_live_modality`]
pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 2 * 60 * 60;

/// Per-subject presence register
#[derive(Clone)]
pub struct ModalityRegister {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    store_timeout: std::time::Duration,
    presence_ttl: Duration,
}

impl ModalityRegister {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
        store_timeout: std::time::Duration,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            gateway,
            clock,
            store_timeout,
            presence_ttl,
        }
    }

    /// Record `channel` as the subject's current channel
    ///
    /// Returns whether the store accepted the write.
    pub async fn set_modality(&self, subject_id: &str, channel: Channel) -> bool {
        let now = self.clock.now();
        let result = with_deadline(
            self.store_timeout,
            "upsert_modality",
            self.gateway.upsert_modality(subject_id, channel, now),
        )
        .await;

        match result {
            Ok(written) => {
                debug!(subject_id, %channel, "Modality set");
                written
            }
            Err(e) => {
                warn!(subject_id, %channel, error = %e, "Failed to set modality");
                false
            }
        }
    }

    /// Refresh the subject's liveness without changing its channel
    ///
    /// Does nothing when the subject has no entry yet.
    pub async fn touch(&self, subject_id: &str) -> bool {
        let now = self.clock.now();
        let result = with_deadline(
            self.store_timeout,
            "touch_modality",
            self.gateway.touch_modality(subject_id, now),
        )
        .await;

        match result {
            Ok(touched) => touched,
            Err(e) => {
                warn!(subject_id, error = %e, "Failed to touch modality");
                false
            }
        }
    }

    /// The subject's last recorded channel, however old
    pub async fn get_modality(&self, subject_id: &str) -> Option<ModalityEntry> {
        let result = with_deadline(
            self.store_timeout,
            "get_modality",
            self.gateway.get_modality(subject_id),
        )
        .await;

        match result {
            Ok(entry) => entry,
            Err(e) => {
                warn!(subject_id, error = %e, "Failed to read modality");
                None
            }
        }
    }

    /// The subject's channel, only if it was active within the presence TTL
    pub async fn get_live_modality(&self, subject_id: &str) -> Option<ModalityEntry> {
        let now = self.clock.now();
        self.get_modality(subject_id)
            .await
            .filter(|entry| entry.is_live(now, self.presence_ttl))
    }
}
