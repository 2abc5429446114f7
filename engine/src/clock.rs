//! Time source
//!
//! Every component that needs "now" asks a [`Clock`], so day rollover and
//! presence liveness can be driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::RwLock;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Jump to an absolute instant
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write().expect("ManualClock lock poisoned") = instant;
    }

    /// Move forward by `delta`
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.write().expect("ManualClock lock poisoned");
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("ManualClock lock poisoned")
    }
}
