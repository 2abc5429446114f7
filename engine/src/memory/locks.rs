//! Per-key single-writer locks
//!
//! Every engine operation that reads and then writes a conversation state
//! holds the lock for its (subject, channel) key, so two appends for the same
//! key never interleave inside one process. Different keys never contend.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use sdk::types::Channel;

type Key = (String, Channel);

/// Lazily created async mutexes keyed by (subject, channel)
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the key
    ///
    /// The returned guard releases the key when dropped.
    pub async fn acquire(&self, subject_id: &str, channel: Channel) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;

            // Drop slots nobody holds or waits on
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);

            Arc::clone(
                slots
                    .entry((subject_id.to_string(), channel))
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        slot.lock_owned().await
    }

    /// Number of keys currently tracked
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}
